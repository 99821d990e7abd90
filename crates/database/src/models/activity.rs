use super::ID;
use crate::schema::{Check, Column, Entity, NewRow, SqlType, Table};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::postgres::Postgres;
use sqlx::query_builder::Separated;
use uuid::Uuid;

/// A span of work (a survey run, a campaign) the series data belongs to.
/// An activity without an end is still ongoing.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Activity {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub started_at: NaiveDateTime,
    pub ended_at: Option<NaiveDateTime>,
    pub created_by_user_id: Option<Uuid>,
}

impl Activity {
    pub fn is_ongoing(&self) -> bool {
        self.ended_at.is_none()
    }
}

impl Entity for Activity {
    const TABLE: Table = Table {
        name: "activities",
        columns: &[
            ID,
            Column::new("name", SqlType::Varchar(255)).not_null(),
            Column::new("description", SqlType::Text),
            Column::new("started_at", SqlType::Timestamp).not_null(),
            Column::new("ended_at", SqlType::Timestamp),
            Column::new("created_by_user_id", SqlType::Uuid).references("users", "id"),
        ],
        checks: &[Check {
            name: "ended_after_start",
            expression: "\"ended_at\" IS NULL OR \"ended_at\" >= \"started_at\"",
        }],
    };
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewActivity {
    pub name: String,
    pub description: Option<String>,
    pub started_at: NaiveDateTime,
    pub ended_at: Option<NaiveDateTime>,
    pub created_by_user_id: Option<Uuid>,
}

impl NewRow for NewActivity {
    fn table_name(&self) -> &'static str {
        Activity::TABLE.name
    }

    fn columns(&self) -> &'static [&'static str] {
        &["name", "description", "started_at", "ended_at", "created_by_user_id"]
    }

    fn push_binds<'args>(&self, values: &mut Separated<'_, 'args, Postgres, &'static str>) {
        values
            .push_bind(self.name.clone())
            .push_bind(self.description.clone())
            .push_bind(self.started_at)
            .push_bind(self.ended_at)
            .push_bind(self.created_by_user_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::User;
    use crate::naming::NamingConvention;
    use crate::schema::Metadata;
    use chrono::NaiveDate;

    fn at(day: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, day)
            .and_then(|d| d.and_hms_opt(8, 0, 0))
            .unwrap()
    }

    #[test]
    fn new_activities_write_every_value_column() {
        let row = NewActivity {
            name: "Cone penetration test".into(),
            description: None,
            started_at: at(1),
            ended_at: Some(at(3)),
            created_by_user_id: None,
        };
        let table = Activity::TABLE;
        let mut expected = table.column_names();
        expected.retain(|column| *column != "id");

        assert_eq!(row.table_name(), "activities");
        assert_eq!(row.columns(), expected.as_slice());
    }

    #[test]
    fn end_before_start_is_rejected_by_a_named_check() {
        let metadata = Metadata::builder(NamingConvention::default())
            .register::<User>()
            .register::<Activity>()
            .build()
            .unwrap();
        let ddl = metadata.create_statements().join("\n");

        assert!(ddl.contains(
            "CONSTRAINT \"ck_activities_ended_after_start\" \
             CHECK (\"ended_at\" IS NULL OR \"ended_at\" >= \"started_at\")"
        ));
        assert!(ddl.contains("CONSTRAINT \"fk_activities_created_by_user_id_users\""));
    }

    #[test]
    fn open_ended_activities_are_ongoing() {
        let mut activity = Activity {
            id: Uuid::nil(),
            name: "Survey".into(),
            description: Some("North sector".into()),
            started_at: at(1),
            ended_at: None,
            created_by_user_id: None,
        };
        assert!(activity.is_ongoing());

        activity.ended_at = Some(at(2));
        assert!(!activity.is_ongoing());
        let json = serde_json::to_value(&activity).unwrap();
        assert_eq!(json["started_at"], "2024-05-01T08:00:00");
        assert_eq!(json["ended_at"], "2024-05-02T08:00:00");
    }
}
