//! Typed SQL builder for the flatten and interpolation stages.
//!
//! Configuration rows carry identifiers and extraction expressions as text.
//! Identifiers are validated, folded to lower case the way Postgres folds
//! unquoted names, and always emitted quoted; expressions are
//! checked for statement terminators and comment markers before they are
//! spliced into a statement. Values never go through this module: every
//! statement here takes its runtime values as `$n` bind parameters.

use std::collections::HashSet;
use std::fmt;

use fitdash_core::{FactMapping, SqlType, StagingMapping, STAGING_PAYLOAD_TABLE};
use thiserror::Error;

const MAX_IDENT_LEN: usize = 63;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SqlBuildError {
    #[error("invalid identifier `{0}`")]
    InvalidIdent(String),
    #[error("invalid qualified name `{0}`")]
    InvalidQualifiedName(String),
    #[error("rejected sql fragment `{fragment}`: {reason}")]
    RejectedFragment { fragment: String, reason: &'static str },
    #[error("staging mapping {0} has no fact columns")]
    NoColumns(i64),
    #[error("staging mapping {staging_id} declares column `{column}` twice")]
    DuplicateColumn { staging_id: i64, column: String },
    #[error("staging mapping {0} flags more than one interpolation timestamp")]
    MultipleTimestamps(i64),
}

/// A validated, lower-cased, always-quoted SQL identifier.
///
/// `SleepScore` and `sleepscore` name the same column, as they would unquoted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Ident(String);

impl Ident {
    pub fn new(raw: &str) -> Result<Self, SqlBuildError> {
        let raw = raw.trim();
        let mut chars = raw.chars();
        let valid_head = chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
        let valid_tail = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid_head || !valid_tail || raw.len() > MAX_IDENT_LEN {
            return Err(SqlBuildError::InvalidIdent(raw.to_string()));
        }
        Ok(Self(raw.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\"", self.0)
    }
}

/// `schema.name` or a bare `name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QualifiedName {
    schema: Option<Ident>,
    name: Ident,
}

impl QualifiedName {
    pub fn parse(raw: &str) -> Result<Self, SqlBuildError> {
        let invalid = || SqlBuildError::InvalidQualifiedName(raw.to_string());
        let parts: Vec<&str> = raw.trim().split('.').collect();
        match parts.as_slice() {
            [name] => Ok(Self {
                schema: None,
                name: Ident::new(name).map_err(|_| invalid())?,
            }),
            [schema, name] => Ok(Self {
                schema: Some(Ident::new(schema).map_err(|_| invalid())?),
                name: Ident::new(name).map_err(|_| invalid())?,
            }),
            _ => Err(invalid()),
        }
    }

    pub fn schema(&self) -> Option<&Ident> {
        self.schema.as_ref()
    }

    pub fn name(&self) -> &Ident {
        &self.name
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{schema}.{}", self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// An operator-authored expression or clause fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlExpr(String);

impl SqlExpr {
    pub fn new(raw: &str) -> Result<Self, SqlBuildError> {
        let fragment = raw.trim();
        let reject = |reason| {
            Err(SqlBuildError::RejectedFragment {
                fragment: fragment.to_string(),
                reason,
            })
        };
        if fragment.is_empty() {
            return reject("empty");
        }

        let mut depth = 0i32;
        let mut in_string = false;
        let mut in_ident = false;
        let mut prev = '\0';
        for c in fragment.chars() {
            match c {
                '\'' if !in_ident => in_string = !in_string,
                '"' if !in_string => in_ident = !in_ident,
                _ if in_string || in_ident => {}
                ';' => return reject("statement terminator"),
                '-' if prev == '-' => return reject("line comment"),
                '*' if prev == '/' => return reject("block comment"),
                '(' => depth += 1,
                ')' => {
                    depth -= 1;
                    if depth < 0 {
                        return reject("unbalanced parentheses");
                    }
                }
                _ => {}
            }
            // Reset so that `''` escapes do not pair with the next quote.
            prev = if in_string || in_ident { '\0' } else { c };
        }
        if in_string || in_ident {
            return reject("unterminated quote");
        }
        if depth != 0 {
            return reject("unbalanced parentheses");
        }
        Ok(Self(fragment.to_string()))
    }

    /// Treats missing, blank and `N/A` configuration values as absent.
    pub fn optional(raw: Option<&str>) -> Result<Option<Self>, SqlBuildError> {
        fitdash_core::non_placeholder(raw).map(Self::new).transpose()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SqlExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnRole {
    Key,
    Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub fact_id: i64,
    pub name: Ident,
    pub expr: SqlExpr,
    pub ty: SqlType,
    pub role: ColumnRole,
    pub interpolation_ts: bool,
}

impl ColumnSpec {
    pub fn from_fact(fact: &FactMapping) -> Result<Self, SqlBuildError> {
        Ok(Self {
            fact_id: fact.fact_id,
            name: Ident::new(&fact.fact_name)?,
            expr: SqlExpr::new(&fact.extraction_sql)?,
            ty: fact.data_type,
            role: if fact.is_unique_constraint {
                ColumnRole::Key
            } else {
                ColumnRole::Value
            },
            interpolation_ts: fact.interpolation_ts,
        })
    }
}

/// Everything needed to project staged payloads into one destination table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlattenSpec {
    pub staging_id: i64,
    source: QualifiedName,
    destination: QualifiedName,
    cross_join: Option<SqlExpr>,
    filter: Option<SqlExpr>,
    columns: Vec<ColumnSpec>,
    payload_source: bool,
}

impl FlattenSpec {
    pub fn from_mapping(
        mapping: &StagingMapping,
        facts: &[FactMapping],
    ) -> Result<Self, SqlBuildError> {
        if facts.is_empty() {
            return Err(SqlBuildError::NoColumns(mapping.staging_id));
        }

        let columns = facts
            .iter()
            .map(ColumnSpec::from_fact)
            .collect::<Result<Vec<_>, _>>()?;

        let mut seen = HashSet::new();
        for column in &columns {
            if !seen.insert(column.name.as_str()) {
                return Err(SqlBuildError::DuplicateColumn {
                    staging_id: mapping.staging_id,
                    column: column.name.as_str().to_string(),
                });
            }
        }
        if columns.iter().filter(|c| c.interpolation_ts).count() > 1 {
            return Err(SqlBuildError::MultipleTimestamps(mapping.staging_id));
        }

        let source_raw = mapping.source_table();
        Ok(Self {
            staging_id: mapping.staging_id,
            source: QualifiedName::parse(source_raw)?,
            destination: QualifiedName::parse(&mapping.destination_table)?,
            cross_join: SqlExpr::optional(mapping.cross_join_condition.as_deref())?,
            filter: SqlExpr::optional(mapping.filter_condition.as_deref())?,
            columns,
            payload_source: source_raw.eq_ignore_ascii_case(STAGING_PAYLOAD_TABLE),
        })
    }

    pub fn destination(&self) -> &QualifiedName {
        &self.destination
    }

    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    /// Only the generic payload table is keyed by task; other sources are read whole.
    pub fn filters_by_task(&self) -> bool {
        self.payload_source
    }

    pub fn timestamp_column(&self) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.interpolation_ts)
    }

    fn keys(&self) -> impl Iterator<Item = &ColumnSpec> {
        self.columns.iter().filter(|c| c.role == ColumnRole::Key)
    }

    fn values(&self) -> impl Iterator<Item = &ColumnSpec> {
        self.columns.iter().filter(|c| c.role == ColumnRole::Value)
    }

    pub fn create_schema_sql(&self) -> Option<String> {
        self.destination
            .schema()
            .map(|schema| format!("CREATE SCHEMA IF NOT EXISTS {schema}"))
    }

    pub fn create_table_sql(&self) -> String {
        let key_count = self.keys().count();
        let mut defs: Vec<String> = self
            .columns
            .iter()
            .map(|c| {
                if key_count == 1 && c.role == ColumnRole::Key {
                    format!("{} {} PRIMARY KEY", c.name, c.ty.as_sql())
                } else {
                    format!("{} {}", c.name, c.ty.as_sql())
                }
            })
            .collect();
        if key_count > 1 {
            let constraint = Ident(format!("pk_{}", self.destination.name().as_str()));
            defs.push(format!(
                "CONSTRAINT {constraint} PRIMARY KEY ({})",
                join(self.keys().map(|c| c.name.to_string()))
            ));
        }
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
            self.destination,
            defs.join(",\n    ")
        )
    }

    /// `INSERT ... SELECT` over the staged rows. Binds `$1` to the task id when
    /// [`filters_by_task`](Self::filters_by_task) is true.
    pub fn upsert_sql(&self) -> String {
        let columns = join(self.columns.iter().map(|c| c.name.to_string()));
        let projections = join(
            self.columns
                .iter()
                .map(|c| format!("({})::{} AS {}", c.expr, c.ty.as_sql(), c.name)),
        );

        let mut extracted = format!("SELECT {projections}");
        if self.payload_source {
            extracted.push_str(&format!(", {}.\"import_id\" AS \"__import_id\"", self.source));
        }
        extracted.push_str(&format!("\n        FROM {}", self.source));
        if let Some(cross_join) = &self.cross_join {
            extracted.push_str(&format!(" {cross_join}"));
        }
        let mut predicates = Vec::new();
        if self.payload_source {
            predicates.push(format!("{}.\"task_id\" = $1", self.source));
        }
        if let Some(filter) = &self.filter {
            predicates.push(format!("({filter})"));
        }
        if !predicates.is_empty() {
            extracted.push_str(&format!("\n        WHERE {}", predicates.join(" AND ")));
        }

        let keys: Vec<String> = self.keys().map(|c| c.name.to_string()).collect();
        if keys.is_empty() {
            return format!(
                "INSERT INTO {} ({columns})\nSELECT {columns} FROM (\n        {extracted}\n) AS extracted",
                self.destination
            );
        }

        let key_list = keys.join(", ");
        let not_null = keys
            .iter()
            .map(|k| format!("{k} IS NOT NULL"))
            .collect::<Vec<_>>()
            .join(" AND ");
        let order = if self.payload_source {
            format!("{key_list}, \"__import_id\" DESC")
        } else {
            key_list.clone()
        };

        let values: Vec<&ColumnSpec> = self.values().collect();
        let conflict = if values.is_empty() {
            format!("ON CONFLICT ({key_list}) DO NOTHING")
        } else {
            let assignments = join(values.iter().map(|c| format!("{0} = EXCLUDED.{0}", c.name)));
            let guard = values
                .iter()
                .map(|c| format!("target.{0} IS DISTINCT FROM EXCLUDED.{0}", c.name))
                .collect::<Vec<_>>()
                .join(" OR ");
            format!("ON CONFLICT ({key_list}) DO UPDATE SET {assignments}\nWHERE {guard}")
        };

        format!(
            "INSERT INTO {} AS target ({columns})\n\
             SELECT {columns} FROM (\n    \
             SELECT DISTINCT ON ({key_list}) {columns} FROM (\n        \
             {extracted}\n    \
             ) AS extracted\n    \
             WHERE {not_null}\n    \
             ORDER BY {order}\n\
             ) AS deduplicated\n\
             {conflict}",
            self.destination
        )
    }

    /// Latest value of the interpolation timestamp column, if one is flagged.
    pub fn recency_sql(&self) -> Option<String> {
        self.timestamp_column().map(|ts| {
            format!(
                "SELECT MAX({})::TIMESTAMPTZ AS recency FROM {}",
                ts.name, self.destination
            )
        })
    }
}

/// One `(timestamp, value)` series feeding a long-format interpolation table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterpolationSpec {
    pub fact_id: i64,
    pub fact_name: String,
    source: QualifiedName,
    ts_column: Ident,
    value_column: Ident,
    destination: QualifiedName,
}

impl InterpolationSpec {
    pub fn new(
        fact_id: i64,
        source_table: &str,
        ts_column: &str,
        value_column: &str,
        destination_table: &str,
    ) -> Result<Self, SqlBuildError> {
        let value_column = Ident::new(value_column)?;
        Ok(Self {
            fact_id,
            fact_name: value_column.as_str().to_string(),
            source: QualifiedName::parse(source_table)?,
            ts_column: Ident::new(ts_column)?,
            value_column,
            destination: QualifiedName::parse(destination_table)?,
        })
    }

    pub fn destination(&self) -> &QualifiedName {
        &self.destination
    }

    pub fn create_schema_sql(&self) -> Option<String> {
        self.destination
            .schema()
            .map(|schema| format!("CREATE SCHEMA IF NOT EXISTS {schema}"))
    }

    pub fn create_table_sql(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    \
             \"ts_utc\" TIMESTAMPTZ NOT NULL,\n    \
             \"fact_name\" TEXT NOT NULL,\n    \
             \"value\" DOUBLE PRECISION,\n    \
             PRIMARY KEY (\"ts_utc\", \"fact_name\")\n)",
            self.destination
        )
    }

    fn ts(&self) -> String {
        format!("({})::TIMESTAMPTZ", self.ts_column)
    }

    fn known(&self) -> String {
        format!(
            "{} IS NOT NULL AND {} IS NOT NULL",
            self.ts_column, self.value_column
        )
    }

    /// `MIN`/`MAX` of the known source timestamps.
    pub fn source_bounds_sql(&self) -> String {
        format!(
            "SELECT MIN({ts}) AS min_ts, MAX({ts}) AS max_ts FROM {} WHERE {}",
            self.source,
            self.known(),
            ts = self.ts()
        )
    }

    /// Binds `$1` = fact name.
    pub fn destination_max_sql(&self) -> String {
        format!(
            "SELECT MAX(\"ts_utc\") AS max_ts FROM {} WHERE \"fact_name\" = $1",
            self.destination
        )
    }

    /// Latest known source timestamp at or before `$1`.
    pub fn latest_before_sql(&self) -> String {
        format!(
            "SELECT MAX({ts}) AS max_ts FROM {} WHERE {} AND {ts} <= $1",
            self.source,
            self.known(),
            ts = self.ts()
        )
    }

    /// Known points in `[$1, $2]`, oldest first.
    pub fn points_sql(&self) -> String {
        format!(
            "SELECT {ts} AS ts, ({})::DOUBLE PRECISION AS value FROM {} \
             WHERE {} AND {ts} >= $1 AND {ts} <= $2 ORDER BY 1",
            self.value_column,
            self.source,
            self.known(),
            ts = self.ts()
        )
    }

    /// Nearest known point strictly before `$1`.
    pub fn anchor_before_sql(&self) -> String {
        format!(
            "SELECT {ts} AS ts, ({})::DOUBLE PRECISION AS value FROM {} \
             WHERE {} AND {ts} < $1 ORDER BY 1 DESC LIMIT 1",
            self.value_column,
            self.source,
            self.known(),
            ts = self.ts()
        )
    }

    /// Nearest known point strictly after `$1`.
    pub fn anchor_after_sql(&self) -> String {
        format!(
            "SELECT {ts} AS ts, ({})::DOUBLE PRECISION AS value FROM {} \
             WHERE {} AND {ts} > $1 ORDER BY 1 ASC LIMIT 1",
            self.value_column,
            self.source,
            self.known(),
            ts = self.ts()
        )
    }

    /// Mean value per UTC minute-of-day, optionally only since `$1`.
    pub fn time_of_day_profile_sql(&self) -> String {
        format!(
            "SELECT (EXTRACT(HOUR FROM {ts} AT TIME ZONE 'UTC') * 60 \
             + EXTRACT(MINUTE FROM {ts} AT TIME ZONE 'UTC'))::INTEGER AS minute_of_day, \
             AVG(({})::DOUBLE PRECISION) AS mean_value FROM {} \
             WHERE {} AND ($1::TIMESTAMPTZ IS NULL OR {ts} >= $1) GROUP BY 1",
            self.value_column,
            self.source,
            self.known(),
            ts = self.ts()
        )
    }

    /// Binds `$1` = fact name, `$2` = timestamps, `$3` = values.
    pub fn upsert_sql(&self) -> String {
        format!(
            "INSERT INTO {} AS target (\"ts_utc\", \"fact_name\", \"value\")\n\
             SELECT bucket.ts, $1, bucket.value FROM UNNEST($2::TIMESTAMPTZ[], $3::DOUBLE PRECISION[]) AS bucket(ts, value)\n\
             ON CONFLICT (\"ts_utc\", \"fact_name\") DO UPDATE SET \"value\" = EXCLUDED.\"value\"\n\
             WHERE target.\"value\" IS DISTINCT FROM EXCLUDED.\"value\"",
            self.destination
        )
    }
}

pub fn call_procedure_sql(procedure: &QualifiedName) -> String {
    format!("CALL {procedure}()")
}

fn join(parts: impl Iterator<Item = String>) -> String {
    parts.collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping() -> StagingMapping {
        StagingMapping {
            staging_id: 3,
            task_id: 9,
            staging_name: Some("plays".into()),
            source_table: None,
            destination_table: "spotify.recently_played".into(),
            cross_join_condition: None,
            filter_condition: Some("payload->>'played_at' IS NOT NULL".into()),
        }
    }

    fn fact(id: i64, name: &str, expr: &str, ty: SqlType, unique: bool) -> FactMapping {
        FactMapping {
            fact_id: id,
            task_id: 9,
            staging_id: 3,
            fact_name: name.into(),
            extraction_sql: expr.into(),
            data_type: ty,
            is_unique_constraint: unique,
            interpolation_ts: false,
            interpolate_values: false,
            infer_values: false,
            forecast_values: false,
            interpolation_destination_table: None,
            max_ts_utc: None,
        }
    }

    #[test]
    fn identifiers_are_validated_and_quoted() {
        assert_eq!(Ident::new("played_at").unwrap().to_string(), "\"played_at\"");
        assert_eq!(Ident::new(" SleepScore ").unwrap().to_string(), "\"sleepscore\"");
        assert!(Ident::new("1st").is_err());
        assert!(Ident::new("name\"; drop").is_err());
        assert!(Ident::new(&"x".repeat(64)).is_err());
        assert_eq!(
            QualifiedName::parse("Garmin.Sleep").unwrap().to_string(),
            "\"garmin\".\"sleep\""
        );
        assert!(QualifiedName::parse("a.b.c").is_err());
    }

    #[test]
    fn fragments_reject_terminators_and_comments() {
        assert!(SqlExpr::new("payload->>'id'").is_ok());
        assert!(SqlExpr::new("(payload->>'note') = 'a;b -- c'").is_ok());
        assert!(SqlExpr::new("1; DROP TABLE x").is_err());
        assert!(SqlExpr::new("payload -- hidden").is_err());
        assert!(SqlExpr::new("payload /* x */").is_err());
        assert!(SqlExpr::new("(payload").is_err());
        assert!(SqlExpr::new("'open").is_err());
        assert_eq!(SqlExpr::optional(Some("N/A")).unwrap(), None);
    }

    #[test]
    fn single_unique_column_is_inline_primary_key() {
        let facts = vec![
            fact(1, "played_at", "payload->>'played_at'", SqlType::TimestampTz, true),
            fact(2, "track", "payload->'track'->>'name'", SqlType::Text, false),
        ];
        let spec = FlattenSpec::from_mapping(&mapping(), &facts).unwrap();
        let ddl = spec.create_table_sql();
        assert!(ddl.contains("\"played_at\" TIMESTAMPTZ PRIMARY KEY"));
        assert!(!ddl.contains("CONSTRAINT"));
        assert_eq!(
            spec.create_schema_sql().as_deref(),
            Some("CREATE SCHEMA IF NOT EXISTS \"spotify\"")
        );
    }

    #[test]
    fn two_unique_columns_form_composite_constraint() {
        let facts = vec![
            fact(1, "day", "payload->>'day'", SqlType::Date, true),
            fact(2, "metric", "payload->>'metric'", SqlType::Text, true),
            fact(3, "value", "payload->>'value'", SqlType::Double, false),
        ];
        let spec = FlattenSpec::from_mapping(&mapping(), &facts).unwrap();
        let ddl = spec.create_table_sql();
        assert!(ddl.contains("CONSTRAINT \"pk_recently_played\" PRIMARY KEY (\"day\", \"metric\")"));
        assert!(!ddl.contains("DATE PRIMARY KEY"));
    }

    #[test]
    fn no_unique_columns_means_no_primary_key_and_plain_insert() {
        let facts = vec![fact(1, "note", "payload->>'note'", SqlType::Text, false)];
        let spec = FlattenSpec::from_mapping(&mapping(), &facts).unwrap();
        assert!(!spec.create_table_sql().contains("PRIMARY KEY"));
        let dml = spec.upsert_sql();
        assert!(!dml.contains("ON CONFLICT"));
        assert!(!dml.contains("DISTINCT ON"));
    }

    #[test]
    fn upsert_guards_against_rewriting_unchanged_rows() {
        let facts = vec![
            fact(1, "played_at", "payload->>'played_at'", SqlType::TimestampTz, true),
            fact(2, "track", "payload->'track'->>'name'", SqlType::Text, false),
            fact(3, "ms", "payload->'track'->>'duration_ms'", SqlType::Integer, false),
        ];
        let spec = FlattenSpec::from_mapping(&mapping(), &facts).unwrap();
        let dml = spec.upsert_sql();
        assert!(dml.contains("(payload->>'played_at')::TIMESTAMPTZ AS \"played_at\""));
        assert!(dml.contains("\"staging\".\"api_imports\".\"task_id\" = $1"));
        assert!(dml.contains("WHERE \"staging\".\"api_imports\".\"task_id\" = $1 AND (payload->>'played_at' IS NOT NULL)"));
        assert!(dml.contains("DISTINCT ON (\"played_at\")"));
        assert!(dml.contains("ORDER BY \"played_at\", \"__import_id\" DESC"));
        assert!(dml.contains("\"track\" = EXCLUDED.\"track\", \"ms\" = EXCLUDED.\"ms\""));
        assert!(dml.contains(
            "WHERE target.\"track\" IS DISTINCT FROM EXCLUDED.\"track\" OR target.\"ms\" IS DISTINCT FROM EXCLUDED.\"ms\""
        ));
        assert!(spec.filters_by_task());
    }

    #[test]
    fn all_key_mapping_does_nothing_on_conflict() {
        let facts = vec![fact(1, "id", "payload->>'id'", SqlType::BigInt, true)];
        let spec = FlattenSpec::from_mapping(&mapping(), &facts).unwrap();
        assert!(spec.upsert_sql().ends_with("ON CONFLICT (\"id\") DO NOTHING"));
    }

    #[test]
    fn mapping_validation_catches_config_mistakes() {
        let mut ts_a = fact(1, "a", "1", SqlType::TimestampTz, false);
        ts_a.interpolation_ts = true;
        let mut ts_b = fact(2, "b", "2", SqlType::TimestampTz, false);
        ts_b.interpolation_ts = true;
        assert_eq!(
            FlattenSpec::from_mapping(&mapping(), &[ts_a.clone(), ts_b]),
            Err(SqlBuildError::MultipleTimestamps(3))
        );
        let dup = fact(3, "A", "3", SqlType::Text, false);
        assert_eq!(
            FlattenSpec::from_mapping(&mapping(), &[ts_a.clone(), dup]),
            Err(SqlBuildError::DuplicateColumn {
                staging_id: 3,
                column: "a".into(),
            })
        );
        assert_eq!(
            FlattenSpec::from_mapping(&mapping(), &[]),
            Err(SqlBuildError::NoColumns(3))
        );
        let spec = FlattenSpec::from_mapping(&mapping(), &[ts_a]).unwrap();
        assert_eq!(
            spec.recency_sql().as_deref(),
            Some("SELECT MAX(\"a\")::TIMESTAMPTZ AS recency FROM \"spotify\".\"recently_played\"")
        );
    }

    #[test]
    fn cross_join_spreads_arrays_inside_one_staged_record() {
        // One staged record per day, holding `[epoch_ms, bpm]` pairs.
        let mut daily = mapping();
        daily.destination_table = "garmin.heart_rate".into();
        daily.cross_join_condition =
            Some("CROSS JOIN LATERAL jsonb_array_elements(payload->'heartRateValues') AS hr".into());
        daily.filter_condition = Some("hr->>1 IS NOT NULL".into());
        let facts = vec![
            fact(1, "measured_at", "to_timestamp((hr->>0)::bigint / 1000)", SqlType::TimestampTz, true),
            fact(2, "bpm", "hr->>1", SqlType::Integer, false),
        ];
        let dml = FlattenSpec::from_mapping(&daily, &facts).unwrap().upsert_sql();
        assert!(dml.contains(
            "FROM \"staging\".\"api_imports\" CROSS JOIN LATERAL jsonb_array_elements(payload->'heartRateValues') AS hr"
        ));
        assert!(dml.contains("(hr->>1)::INTEGER AS \"bpm\""));
        assert!(dml.contains("AND (hr->>1 IS NOT NULL)"));
    }

    #[test]
    fn custom_source_tables_are_not_task_filtered() {
        let mut custom = mapping();
        custom.source_table = Some("garmin.raw_heart_rate".into());
        custom.cross_join_condition = None;
        custom.filter_condition = None;
        let facts = vec![fact(1, "ts", "ts", SqlType::TimestampTz, true)];
        let spec = FlattenSpec::from_mapping(&custom, &facts).unwrap();
        let dml = spec.upsert_sql();
        assert!(!spec.filters_by_task());
        assert!(!dml.contains("$1"));
        assert!(!dml.contains("__import_id"));
    }

    #[test]
    fn interpolation_statements_target_long_format_table() {
        let spec = InterpolationSpec::new(
            4,
            "garmin.heart_rate",
            "measured_at",
            "BPM",
            "interpolated.heart_rate",
        )
        .unwrap();
        assert!(spec
            .create_table_sql()
            .contains("PRIMARY KEY (\"ts_utc\", \"fact_name\")"));
        assert!(spec.upsert_sql().contains("IS DISTINCT FROM EXCLUDED.\"value\""));
        assert!(spec.anchor_before_sql().contains("< $1 ORDER BY 1 DESC LIMIT 1"));
        assert_eq!(spec.fact_name, "bpm");
        assert_eq!(
            call_procedure_sql(&QualifiedName::parse("spotify.parse_plays").unwrap()),
            "CALL \"spotify\".\"parse_plays\"()"
        );
    }
}
