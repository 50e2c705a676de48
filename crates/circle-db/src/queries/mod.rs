pub mod conversations;
pub mod messages;
pub mod posts;
pub mod relationships;
pub mod users;

#[cfg(test)]
pub(crate) mod fixtures {
    use rusqlite::Connection;
    use uuid::Uuid;

    use super::users::{self, NewUser};

    /// Insert a throwaway account and return its id.
    pub fn user(conn: &Connection, username: &str) -> Uuid {
        let id = Uuid::new_v4();
        users::insert_user(
            conn,
            &NewUser {
                id,
                username,
                display_name: None,
                email: &format!("{}@example.com", username),
                password_hash: "hash",
            },
        )
        .unwrap();
        id
    }
}
