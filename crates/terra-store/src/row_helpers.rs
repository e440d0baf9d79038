use crate::error::StoreError;

/// Get a required column value from a row, returning CorruptRow on failure.
pub fn get<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    row.get(idx).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: e.to_string(),
    })
}

/// Get an optional column value.
pub fn get_opt<T: rusqlite::types::FromSql>(
    row: &rusqlite::Row<'_>,
    idx: usize,
    table: &'static str,
    column: &'static str,
) -> Result<Option<T>, StoreError> {
    row.get(idx).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: e.to_string(),
    })
}

/// Parse a string into an enum, returning CorruptRow on failure.
pub fn parse_enum<T: std::str::FromStr>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    raw.parse().map_err(|_| StoreError::CorruptRow {
        table,
        column,
        detail: format!("unknown variant: {raw}"),
    })
}

/// Parse a JSON string column into a concrete type.
pub fn parse_json<T: serde::de::DeserializeOwned>(
    raw: &str,
    table: &'static str,
    column: &'static str,
) -> Result<T, StoreError> {
    serde_json::from_str(raw).map_err(|e| StoreError::CorruptRow {
        table,
        column,
        detail: format!("invalid JSON: {e}"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use terra_core::entry::EntryStatus;

    #[test]
    fn parse_enum_success() {
        let status: EntryStatus = parse_enum("tentative", "glossary_entry", "status").unwrap();
        assert_eq!(status, EntryStatus::Tentative);
    }

    #[test]
    fn parse_enum_failure() {
        let result: Result<EntryStatus, _> = parse_enum("retired", "glossary_entry", "status");
        assert!(matches!(
            result,
            Err(StoreError::CorruptRow { table: "glossary_entry", column: "status", .. })
        ));
    }

    #[test]
    fn parse_json_failure() {
        let result: Result<Vec<i64>, _> = parse_json("not json", "snapshot_context", "completed_thread_ids");
        assert!(matches!(result, Err(StoreError::CorruptRow { .. })));
    }
}
