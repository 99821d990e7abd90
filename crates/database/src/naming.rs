//! Deterministic names for constraints and indexes.
//!
//! Every constraint and index created from the schema registry is named from
//! a template, so the DDL is identical across environments and an external
//! migration tool never sees spurious renames.

use crate::error::DbError;
use std::borrow::Cow;

/// PostgreSQL silently truncates identifiers longer than this.
pub const MAX_IDENTIFIER_LEN: usize = 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConstraintKind {
    Index,
    Unique,
    Check,
    ForeignKey,
    PrimaryKey,
}

/// The values a template may refer to.
///
/// Templates use `{token}` placeholders: `{table_name}`, `{column_0_name}`,
/// `{column_0_label}` (`<table>_<column>`), `{referred_table_name}` and
/// `{constraint_name}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NameParts<'a> {
    pub table_name: &'a str,
    pub column_0_name: Option<&'a str>,
    pub referred_table_name: Option<&'a str>,
    pub constraint_name: Option<&'a str>,
}

/// One template per constraint kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamingConvention {
    pub index: Cow<'static, str>,
    pub unique: Cow<'static, str>,
    pub check: Cow<'static, str>,
    pub foreign_key: Cow<'static, str>,
    pub primary_key: Cow<'static, str>,
}

impl Default for NamingConvention {
    fn default() -> Self {
        Self {
            index: Cow::Borrowed("ix_{column_0_label}"),
            unique: Cow::Borrowed("uq_{table_name}_{column_0_name}"),
            check: Cow::Borrowed("ck_{table_name}_{constraint_name}"),
            foreign_key: Cow::Borrowed("fk_{table_name}_{column_0_name}_{referred_table_name}"),
            primary_key: Cow::Borrowed("pk_{table_name}"),
        }
    }
}

impl NamingConvention {
    pub fn template(&self, kind: ConstraintKind) -> &str {
        match kind {
            ConstraintKind::Index => &self.index,
            ConstraintKind::Unique => &self.unique,
            ConstraintKind::Check => &self.check,
            ConstraintKind::ForeignKey => &self.foreign_key,
            ConstraintKind::PrimaryKey => &self.primary_key,
        }
    }

    /// Renders the name for a constraint of `kind`.
    ///
    /// # Errors
    ///
    /// Fails when the template refers to a token that `parts` does not
    /// provide, names an unknown token, or renders longer than
    /// [`MAX_IDENTIFIER_LEN`].
    pub fn name(&self, kind: ConstraintKind, parts: &NameParts<'_>) -> Result<String, DbError> {
        let template = self.template(kind);
        let mut out = String::with_capacity(template.len() + 16);
        let mut rest = template;

        while let Some(open) = rest.find('{') {
            out.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let close = after.find('}').ok_or_else(|| {
                DbError::NamingConvention(format!("unterminated '{{' in template '{template}'"))
            })?;
            let token = &after[..close];
            out.push_str(&resolve_token(token, parts, template)?);
            rest = &after[close + 1..];
        }
        out.push_str(rest);

        if out.len() > MAX_IDENTIFIER_LEN {
            return Err(DbError::NamingConvention(format!(
                "generated name '{out}' exceeds {MAX_IDENTIFIER_LEN} characters"
            )));
        }
        Ok(out)
    }
}

fn resolve_token<'a>(
    token: &str,
    parts: &NameParts<'a>,
    template: &str,
) -> Result<Cow<'a, str>, DbError> {
    let missing = || {
        DbError::NamingConvention(format!(
            "template '{template}' needs '{token}' for table '{}'",
            parts.table_name
        ))
    };
    match token {
        "table_name" => Ok(Cow::Borrowed(parts.table_name)),
        "column_0_name" => parts.column_0_name.map(Cow::Borrowed).ok_or_else(missing),
        "column_0_label" => parts
            .column_0_name
            .map(|column| Cow::Owned(format!("{}_{column}", parts.table_name)))
            .ok_or_else(missing),
        "referred_table_name" => parts.referred_table_name.map(Cow::Borrowed).ok_or_else(missing),
        "constraint_name" => parts.constraint_name.map(Cow::Borrowed).ok_or_else(missing),
        other => Err(DbError::NamingConvention(format!(
            "unknown token '{other}' in template '{template}'"
        ))),
    }
}
