//! Nested sessions example
//!
//! This example demonstrates:
//! - Root sessions that own a connection and a transaction
//! - Nested sessions running as savepoints on the root's connection
//! - Rolling back nested work while keeping the root's
//! - Isolation between execution contexts
//!
//! Run with: cargo run --example nested_sessions

use rust_session_pool::prelude::*;
use std::sync::Arc;

async fn balance(accounts: &DataService, owner: &str) -> Result<f64> {
    accounts
        .execute_scalar(
            "SELECT balance FROM accounts WHERE owner = :owner",
            Parameters::new().with("owner", owner),
        )
        .await
}

async fn transfer(accounts: &DataService, from: &str, to: &str, amount: f64) -> Result<()> {
    let session = accounts.begin_session(IsolationLevel::Unspecified).await?;
    println!(
        "   {} session {} for {} -> {}",
        if session.is_root() { "root" } else { "nested" },
        session.id(),
        from,
        to
    );

    accounts
        .execute_non_query(
            "UPDATE accounts SET balance = balance - :amount WHERE owner = :owner",
            Parameters::new().with("amount", amount).with("owner", from),
        )
        .await?;
    accounts
        .execute_non_query(
            "UPDATE accounts SET balance = balance + :amount WHERE owner = :owner",
            Parameters::new().with("amount", amount).with("owner", to),
        )
        .await?;

    if balance(accounts, from).await? < 0.0 {
        println!("   ✗ {} would be overdrawn, rolling back", from);
        session.rollback().await?;
    } else {
        session.commit().await?;
    }
    session.dispose().await
}

#[tokio::main]
async fn main() -> Result<()> {
    println!("=== Rust Session Pool - Nested Sessions Example ===\n");

    let dir = std::env::temp_dir().join(format!("session-pool-nested-{}", std::process::id()));
    std::fs::create_dir_all(&dir).map_err(|e| DatabaseError::configuration_missing(e.to_string()))?;
    let config = Arc::new(
        DataSourceConfig::new()
            .with_default_key("bank")
            .with_connection("bank", format!("data source={}", dir.join("bank.db").display())),
    );
    let manager = Arc::new(SessionManager::new(Arc::new(SqliteDriver::new())));

    let setup = DataService::default_database(Arc::clone(&manager), Arc::clone(&config), ExecutionContextId::new())?;
    setup
        .execute_non_query(
            "CREATE TABLE IF NOT EXISTS accounts (owner TEXT PRIMARY KEY, balance REAL NOT NULL)",
            Parameters::new(),
        )
        .await?;
    setup.execute_non_query("DELETE FROM accounts", Parameters::new()).await?;
    for (owner, amount) in [("alice", 100.0), ("bob", 50.0), ("carol", 0.0)] {
        setup
            .execute_non_query(
                "INSERT INTO accounts (owner, balance) VALUES (:owner, :balance)",
                Parameters::new().with("owner", owner).with("balance", amount),
            )
            .await?;
    }

    println!("1. Root session with nested transfers...");
    let ctx = ExecutionContextId::new();
    let accounts = DataService::default_database(Arc::clone(&manager), Arc::clone(&config), ctx)?;
    let outer = accounts.begin_session(IsolationLevel::Serializable).await?;

    transfer(&accounts, "alice", "bob", 30.0).await?;
    transfer(&accounts, "carol", "alice", 10.0).await?;
    println!("   Children still open: {}", outer.children().len());

    let observer = DataService::default_database(Arc::clone(&manager), Arc::clone(&config), ExecutionContextId::new())?;
    println!(
        "   Inside: alice={:.2}  Outside: alice={:.2}",
        balance(&accounts, "alice").await?,
        balance(&observer, "alice").await?
    );

    outer.commit().await?;
    outer.dispose().await?;
    println!("   ✓ Root committed\n");

    println!("2. Final balances...");
    for owner in ["alice", "bob", "carol"] {
        println!("   {:<6} {:>8.2}", owner, balance(&observer, owner).await?);
    }
    println!();

    println!("3. Work that fails is rolled back...");
    let target = config.default_target()?;
    let outcome = manager
        .run_in_session(ExecutionContextId::new(), &target, IsolationLevel::Unspecified, |conn| async move {
            Command::new(Arc::clone(&conn), "UPDATE accounts SET balance = 0")
                .execute_non_query()
                .await?;
            Command::new(conn, "UPDATE missing_table SET balance = 0")
                .execute_non_query()
                .await
        })
        .await;
    println!("   Outcome: {}", outcome.map(|_| "ok".to_string()).unwrap_or_else(|e| e.to_string()));
    println!("   alice still has {:.2}\n", balance(&observer, "alice").await?);

    let _ = std::fs::remove_dir_all(&dir);
    println!("=== Example completed successfully ===");
    Ok(())
}
