use crate::types::RunRecord;
use redis::{AsyncCommands, RedisResult};
use uuid::Uuid;

/// Redis key layout for persisted runs.
/// Records expire after 24 hours; the latest-run pointer is refreshed on
/// every store.

pub const RUN_PREFIX: &str = "testbox:run";
pub const LATEST_PREFIX: &str = "testbox:latest";

/// Key holding the full record of a run
pub fn run_key(run_id: &Uuid) -> String {
    format!("{}:{}", RUN_PREFIX, run_id)
}

/// Key holding the id of the most recent run for a base name
pub fn latest_key(name: &str) -> String {
    format!("{}:{}", LATEST_PREFIX, name)
}

fn serialization_error(e: serde_json::Error) -> redis::RedisError {
    redis::RedisError::from((redis::ErrorKind::TypeError, "serialization error", e.to_string()))
}

/// Store a finished run and point the latest key for its name at it
pub async fn store_run(
    conn: &mut redis::aio::ConnectionManager,
    record: &RunRecord,
) -> RedisResult<()> {
    let key = run_key(&record.run_id);
    let payload = serde_json::to_string(record).map_err(serialization_error)?;

    let _: () = conn.set_ex(&key, payload, 86400).await?;
    let _: () = conn
        .set_ex(latest_key(&record.name), record.run_id.to_string(), 86400)
        .await?;

    Ok(())
}

/// Fetch a stored run
pub async fn get_run(
    conn: &mut redis::aio::ConnectionManager,
    run_id: &Uuid,
) -> RedisResult<Option<RunRecord>> {
    let payload: Option<String> = conn.get(run_key(run_id)).await?;

    match payload {
        Some(data) => {
            let record: RunRecord = serde_json::from_str(&data).map_err(|e| {
                redis::RedisError::from((
                    redis::ErrorKind::TypeError,
                    "deserialization error",
                    e.to_string(),
                ))
            })?;
            Ok(Some(record))
        }
        None => Ok(None),
    }
}

/// Id of the most recent stored run for a base name
pub async fn latest_run_id(
    conn: &mut redis::aio::ConnectionManager,
    name: &str,
) -> RedisResult<Option<Uuid>> {
    let id: Option<String> = conn.get(latest_key(name)).await?;
    Ok(id.and_then(|s| Uuid::parse_str(&s).ok()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExecutionResult, InstanceOutcome, RunResultSet};
    use chrono::Utc;

    #[test]
    fn test_run_key_deterministic() {
        let id = Uuid::new_v4();
        assert_eq!(run_key(&id), run_key(&id));
        assert!(run_key(&id).starts_with("testbox:run:"));
        assert!(run_key(&id).contains(&id.to_string()));
    }

    #[test]
    fn test_latest_key_format() {
        assert_eq!(latest_key("nightly"), "testbox:latest:nightly");
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_store_and_fetch_run() {
        let client = redis::Client::open("redis://127.0.0.1:6379")
            .expect("Failed to create Redis client");
        let mut conn = client
            .get_connection_manager()
            .await
            .expect("Failed to connect to Redis");

        let mut results = RunResultSet::new();
        results.record(
            "t-ubuntu",
            InstanceOutcome::Completed(ExecutionResult {
                exit_code: Some(0),
                stdout: Some(String::new()),
                stderr: Some(String::new()),
            }),
        );
        let record = RunRecord {
            run_id: Uuid::new_v4(),
            name: "t".to_string(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            results,
        };

        store_run(&mut conn, &record).await.unwrap();

        let fetched = get_run(&mut conn, &record.run_id).await.unwrap().unwrap();
        assert_eq!(fetched.results, record.results);
        assert_eq!(
            latest_run_id(&mut conn, "t").await.unwrap(),
            Some(record.run_id)
        );
    }
}
