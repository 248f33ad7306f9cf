pub mod accounts;
pub mod calls;
pub mod chats;
pub mod classes;
pub mod core;
pub mod family;
pub mod leaves;
pub mod notices;
pub mod personnel;
pub mod profile;
pub mod schedules;
pub mod students;
pub mod todos;
