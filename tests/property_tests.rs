//! Property-based tests using proptest

mod common;

use common::ScriptedDriver;
use proptest::prelude::*;
use rust_session_pool::core::reader::ResultSet;
use rust_session_pool::core::transaction::savepoint_name;
use rust_session_pool::prelude::*;
use rust_session_pool::{ConnectionKey, ConnectionRegistry, Driver};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use uuid::Uuid;

fn option_map() -> impl Strategy<Value = BTreeMap<String, String>> {
    prop::collection::btree_map("[a-z][a-z ]{0,8}[a-z]", "[A-Za-z0-9_./:-]{1,12}", 1..6)
}

fn render(options: &[(String, String)]) -> String {
    options
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(";")
}

fn reader_over(value: DatabaseValue) -> DataReader {
    let mut set = ResultSet::new(vec!["v".to_string()]);
    set.push_row(vec![value]);
    let mut reader = DataReader::new(set);
    reader.advance();
    reader
}

// ============================================================================
// Identity
// ============================================================================

proptest! {
    /// Keys that differ only in the case of the name are the same key
    #[test]
    fn test_connection_key_ignores_name_case(name in "[A-Za-z][A-Za-z0-9_-]{0,20}") {
        let ctx = ExecutionContextId::new();
        let mut keys = HashSet::new();
        keys.insert(ConnectionKey::new(ctx, name.to_ascii_lowercase()));
        keys.insert(ConnectionKey::new(ctx, name.to_ascii_uppercase()));
        keys.insert(ConnectionKey::new(ctx, name.clone()));
        prop_assert_eq!(keys.len(), 1);

        let other = ConnectionKey::new(ExecutionContextId::new(), name.clone());
        prop_assert!(!keys.contains(&other));
    }

    /// Rendering a parsed target and parsing it again gives an equal target
    #[test]
    fn test_target_render_parse(options in option_map()) {
        let options: Vec<(String, String)> = options.into_iter().collect();
        let target = ConnectionTarget::parse(&render(&options)).unwrap();
        let reparsed = ConnectionTarget::parse(&target.to_connection_string()).unwrap();
        prop_assert_eq!(&reparsed, &target);
        for (key, value) in &options {
            prop_assert_eq!(target.get(key), Some(value.as_str()));
        }
    }

    /// Option order and key case do not affect target equality
    #[test]
    fn test_target_equality_ignores_order_and_key_case(options in option_map()) {
        let forward: Vec<(String, String)> = options.clone().into_iter().collect();
        let backward: Vec<(String, String)> = options
            .into_iter()
            .rev()
            .map(|(k, v)| (k.to_ascii_uppercase(), v))
            .collect();
        let a = ConnectionTarget::parse(&render(&forward)).unwrap();
        let b = ConnectionTarget::parse(&render(&backward)).unwrap();
        prop_assert_eq!(a, b);
    }

    /// A changed value makes targets differ
    #[test]
    fn test_target_values_compare_verbatim(options in option_map(), suffix in "[a-z]{1,4}") {
        let options: Vec<(String, String)> = options.into_iter().collect();
        let mut changed = options.clone();
        changed[0].1.push_str(&suffix);
        let a = ConnectionTarget::parse(&render(&options)).unwrap();
        let b = ConnectionTarget::parse(&render(&changed)).unwrap();
        prop_assert_ne!(a, b);
    }

    /// Savepoint names are `sp_` plus 32 hex digits
    #[test]
    fn test_savepoint_name_format(raw in any::<u128>()) {
        let name = savepoint_name(Uuid::from_u128(raw));
        prop_assert!(name.starts_with("sp_"));
        prop_assert_eq!(name.len(), 35);
        prop_assert!(name[3..].chars().all(|c| c.is_ascii_hexdigit()));
    }
}

// ============================================================================
// Parameters and values
// ============================================================================

proptest! {
    /// Prefix and case variants of a name address the same parameter
    #[test]
    fn test_parameter_prefix_variants(name in "[a-z][a-z0-9_]{0,12}", first in any::<i64>(), second in any::<i64>()) {
        let mut params = Parameters::new().with(format!("@{}", name), first);
        params.set(format!(":{}", name.to_ascii_uppercase()), second);
        params.set(format!("${}", name), second);

        prop_assert_eq!(params.len(), 1);
        prop_assert_eq!(params.get(&name), Some(&DatabaseValue::Long(second)));
        let at_name = format!("@{}", name);
        prop_assert!(params.contains(&at_name));
    }

    /// Short rows are padded with nulls, wide rows rejected
    #[test]
    fn test_table_rows_fit_columns(columns in 1usize..6, cells in 0usize..8) {
        let mut table = TableValue::new((0..columns).map(|i| format!("c{}", i)));
        let row: Vec<DatabaseValue> = (0..cells as i64).map(DatabaseValue::Long).collect();
        let pushed = table.push_row(row);

        if cells <= columns {
            prop_assert!(pushed.is_ok());
            let stored = &table.rows()[0];
            prop_assert_eq!(stored.len(), columns);
            prop_assert!(stored[cells..].iter().all(DatabaseValue::is_null));
        } else {
            let is_mismatch = matches!(pushed, Err(DatabaseError::TypeMismatch { .. }));
            prop_assert!(is_mismatch);
            prop_assert!(table.is_empty());
        }
    }

    /// Scalar mapping returns the stored value
    #[test]
    fn test_scalar_mapper_long(value in any::<i64>()) {
        let reader = reader_over(DatabaseValue::Long(value));
        let mapped: i64 = ScalarMapper.map_row(&reader).unwrap();
        prop_assert_eq!(mapped, value);

        let optional: Option<i64> = ScalarMapper.map_row(&reader).unwrap();
        prop_assert_eq!(optional, Some(value));
    }

    /// Text values map back to the same string
    #[test]
    fn test_scalar_mapper_text(value in ".*") {
        let reader = reader_over(DatabaseValue::from(value.as_str()));
        let mapped: String = ScalarMapper.map_row(&reader).unwrap();
        prop_assert_eq!(mapped, value);
    }

    /// Int values widen to long
    #[test]
    fn test_int_widens_to_long(value in any::<i32>()) {
        let db_val = DatabaseValue::from(value);
        prop_assert_eq!(db_val.as_long(), Some(value as i64));
        prop_assert_eq!(db_val.type_name(), "int");
    }
}

// ============================================================================
// Retry bounds
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Broken links are retried until three executions have been made
    #[test]
    fn test_retry_bound(breaks in 0usize..6) {
        let driver = ScriptedDriver::new();
        let outcome = tokio_test::block_on(async {
            let registry = Arc::new(ConnectionRegistry::new());
            let dyn_driver: Arc<dyn Driver> = Arc::new(driver.clone());
            let target = ConnectionTarget::parse("scripted").unwrap();
            let conn = Connection::get_or_create(&registry, &dyn_driver, ExecutionContextId::new(), "main", &target, true)
                .await
                .unwrap();
            driver.script.break_runs.store(breaks, Ordering::SeqCst);
            Command::new(conn, "SELECT 1").execute_scalar().await
        });

        prop_assert_eq!(driver.script.runs(), (breaks + 1).min(3));
        if breaks < 3 {
            prop_assert_eq!(outcome.unwrap(), DatabaseValue::Long(breaks as i64 + 1));
        } else {
            prop_assert!(outcome.unwrap_err().is_retry_exhaustion());
        }
    }
}

#[test]
fn test_null_maps_only_to_option() {
    let reader = reader_over(DatabaseValue::Null);
    let optional: Option<i64> = ScalarMapper.map_row(&reader).unwrap();
    assert_eq!(optional, None);

    let err = RowMapper::<i64>::map_row(&ScalarMapper, &reader).unwrap_err();
    assert!(matches!(err, DatabaseError::TypeMismatch { .. }));
}
