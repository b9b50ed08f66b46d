//! Basic data service usage example
//!
//! This example demonstrates:
//! - Configuring data sources
//! - Running statements through a `DataService`
//! - Mapping rows with scalar, record and closure mappers
//! - Reading output values
//!
//! Run with: cargo run --example basic_usage

use rust_session_pool::prelude::*;
use std::sync::Arc;

#[derive(Debug)]
struct User {
    id: i64,
    username: String,
    balance: f64,
}

impl FromRow for User {
    fn from_row(reader: &DataReader) -> Result<Self> {
        Ok(User {
            id: reader.get("id")?,
            username: reader.get("username")?,
            balance: reader.get("balance")?,
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    println!("=== Rust Session Pool - Basic Usage Example ===\n");

    let dir = std::env::temp_dir().join(format!("session-pool-demo-{}", std::process::id()));
    std::fs::create_dir_all(&dir).map_err(|e| DatabaseError::configuration_missing(e.to_string()))?;
    let db_path = dir.join("basic.db");

    println!("1. Configuring data sources...");
    let config = Arc::new(
        DataSourceConfig::new()
            .with_default_key("main")
            .with_connection("main", format!("data source={}", db_path.display())),
    );
    let manager = Arc::new(SessionManager::new(Arc::new(SqliteDriver::new())));
    let users = DataService::default_database(Arc::clone(&manager), config, ExecutionContextId::new())?;
    println!("   ✓ Default database: {}\n", users.target()?);

    println!("2. Creating table...");
    users
        .execute_non_query(
            "CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL,
                balance REAL NOT NULL
            )",
            Parameters::new(),
        )
        .await?;
    users.execute_non_query("DELETE FROM users", Parameters::new()).await?;
    println!("   ✓ Table ready\n");

    println!("3. Inserting data...");
    for (username, balance) in [("alice", 1500.50), ("bob", 2300.75), ("charlie", 980.25)] {
        users
            .execute_non_query(
                "INSERT INTO users (username, balance) VALUES (:username, :balance)",
                Parameters::new()
                    .with("username", username)
                    .with("balance", balance),
            )
            .await?;
        println!("   ✓ Inserted {}", username);
    }
    println!();

    println!("4. Querying records...");
    let all: Vec<User> = users
        .find_multiple("SELECT id, username, balance FROM users ORDER BY id", Parameters::new(), &RecordMapper)
        .await?;
    for user in &all {
        println!("   {:>2} {:<10} {:>10.2}", user.id, user.username, user.balance);
    }
    println!();

    println!("5. Single lookups...");
    let bob: Option<User> = users
        .find_single(
            "SELECT id, username, balance FROM users WHERE username = @name",
            Parameters::new().with("@name", "bob"),
            &RecordMapper,
        )
        .await?;
    println!("   bob     -> {:?}", bob);
    let nobody: Option<String> = users
        .find_single(
            "SELECT username FROM users WHERE username = @name",
            Parameters::new().with("@name", "zoe"),
            &ScalarMapper,
        )
        .await?;
    println!("   zoe     -> {:?}", nobody);
    match users
        .find_single::<String, _>("SELECT username FROM users", Parameters::new(), &ScalarMapper)
        .await
    {
        Err(DatabaseError::MultipleRecordsFound { count }) => {
            println!("   all     -> rejected, {} rows", count)
        }
        other => println!("   all     -> {:?}", other),
    }
    println!();

    println!("6. Scalars and outputs...");
    let total: f64 = users
        .execute_scalar("SELECT SUM(balance) FROM users", Parameters::new())
        .await?;
    println!("   Total balance: {:.2}", total);

    let outputs = users
        .execute_void(
            "SELECT COUNT(*) AS user_count, MAX(balance) AS top_balance FROM users",
            Parameters::new(),
            &["@user_count", "@top_balance"],
        )
        .await?;
    println!("   Outputs: {:?}", outputs);

    let labels = users
        .find_multiple(
            "SELECT username, balance FROM users WHERE balance > :min ORDER BY balance DESC",
            Parameters::new().with("min", 1000.0),
            &MapFn::new(|row: &DataReader| {
                Ok(format!("{} ({:.0})", row.get::<String>("username")?, row.get::<f64>("balance")?))
            }),
        )
        .await?;
    println!("   Above 1000: {}\n", labels.join(", "));

    let _ = std::fs::remove_dir_all(&dir);
    println!("=== Example completed successfully ===");
    Ok(())
}
