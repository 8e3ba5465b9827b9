use redb::TableDefinition;

/// Users: username -> encoded password hash
pub const USERS: TableDefinition<&str, &str> = TableDefinition::new("users");

/// Objects: oid -> Object (msgpack)
pub const OBJECTS: TableDefinition<&str, &[u8]> = TableDefinition::new("objects");

/// Projects: name -> Project (msgpack)
pub const PROJECTS: TableDefinition<&str, &[u8]> = TableDefinition::new("projects");
