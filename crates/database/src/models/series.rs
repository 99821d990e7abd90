use super::ID;
use crate::schema::{Column, Entity, NewRow, SqlType, Table};
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::postgres::Postgres;
use sqlx::query_builder::Separated;
use uuid::Uuid;

/// One measurement in time.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Timeseries {
    pub id: Uuid,
    pub datetime: NaiveDateTime,
    pub value: Option<f64>,
}

impl Entity for Timeseries {
    const TABLE: Table = Table {
        name: "timeseries",
        columns: &[
            ID,
            Column::new("datetime", SqlType::Timestamp).not_null(),
            Column::new("value", SqlType::Double),
        ],
        checks: &[],
    };
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewTimeseries {
    pub datetime: NaiveDateTime,
    pub value: Option<f64>,
}

impl NewRow for NewTimeseries {
    fn table_name(&self) -> &'static str {
        Timeseries::TABLE.name
    }

    fn columns(&self) -> &'static [&'static str] {
        &["datetime", "value"]
    }

    fn push_binds<'args>(&self, values: &mut Separated<'_, 'args, Postgres, &'static str>) {
        values.push_bind(self.datetime).push_bind(self.value);
    }
}

/// One measurement along a depth axis.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Depthseries {
    pub id: Uuid,
    pub depth: f64,
    pub value: Option<f64>,
}

impl Entity for Depthseries {
    const TABLE: Table = Table {
        name: "depthseries",
        columns: &[
            ID,
            Column::new("depth", SqlType::Double).not_null(),
            Column::new("value", SqlType::Double),
        ],
        checks: &[],
    };
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewDepthseries {
    pub depth: f64,
    pub value: Option<f64>,
}

impl NewRow for NewDepthseries {
    fn table_name(&self) -> &'static str {
        Depthseries::TABLE.name
    }

    fn columns(&self) -> &'static [&'static str] {
        &["depth", "value"]
    }

    fn push_binds<'args>(&self, values: &mut Separated<'_, 'args, Postgres, &'static str>) {
        values.push_bind(self.depth).push_bind(self.value);
    }
}
