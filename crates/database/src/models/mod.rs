//! The application's tables.

mod accounts;
mod activity;
mod series;

pub use accounts::{
    NewRole, NewUser, NewUserRole, Role, User, UserRole, find_user_by_name, hash_password,
    role_names_for_user, verify_password,
};
pub use activity::{Activity, NewActivity};
pub use series::{Depthseries, NewDepthseries, NewTimeseries, Timeseries};

use crate::error::DbError;
use crate::naming::NamingConvention;
use crate::schema::{Column, Metadata, SqlType};

/// Every table's primary key: a UUID generated by the database.
const ID: Column = Column::new("id", SqlType::Uuid)
    .primary_key()
    .index()
    .server_default("gen_random_uuid()");

/// The schema registry for every table above, in foreign-key order.
pub fn metadata() -> Result<Metadata, DbError> {
    Metadata::builder(NamingConvention::default())
        .register::<User>()
        .register::<Role>()
        .register::<UserRole>()
        .register::<Timeseries>()
        .register::<Depthseries>()
        .register::<Activity>()
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_table_is_registered() {
        let metadata = metadata().unwrap();
        let names: Vec<&str> = metadata.tables().iter().map(|t| t.name).collect();
        assert_eq!(
            names,
            ["users", "roles", "user_roles", "timeseries", "depthseries", "activities"]
        );
    }

    #[test]
    fn every_primary_key_is_generated_server_side() {
        let metadata = metadata().unwrap();
        for table in metadata.tables() {
            let id = table.column("id").unwrap();
            assert!(id.primary_key && id.index && !id.nullable, "{}", table.name);
            assert_eq!(id.server_default, Some("gen_random_uuid()"));
        }
        let ddl = metadata.create_statements().join("\n");
        assert!(ddl.contains(
            "CREATE INDEX IF NOT EXISTS \"ix_timeseries_id\" ON \"timeseries\" (\"id\")"
        ));
        assert!(ddl.contains("CONSTRAINT \"fk_roles_created_by_user_id_users\""));
    }
}
