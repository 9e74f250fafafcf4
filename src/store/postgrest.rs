use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde_json::{json, Value};

use super::{
    Filter, QueueStore, Row, RowId, Table, ORDER_COLUMN, OWNER_COLUMN, PENDING, STATUS_COLUMN,
};
use crate::config::StoreConfig;
use crate::error::{AgentError, Result};

/// Pending rows fetched per claim attempt. Rows lost to a racing claimer are
/// skipped in favour of the next one.
const CLAIM_CANDIDATES: usize = 5;

/// Queue store backed by a PostgREST endpoint (Supabase `rest/v1`).
///
/// `replace_all` calls the `replace_<table>(p_user_id, p_rows)` database function,
/// which performs the delete and the insert inside one transaction.
#[derive(Debug, Clone)]
pub struct PostgrestStore {
    client: Client,
    base_url: String,
    service_key: String,
}

impl PostgrestStore {
    pub fn new(config: &StoreConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            service_key: config.service_key.clone(),
        })
    }

    fn table_url(&self, table: Table) -> String {
        format!("{}/rest/v1/{}", self.base_url, table.name())
    }

    fn rpc_url(&self, function: &str) -> String {
        format!("{}/rest/v1/rpc/{}", self.base_url, function)
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.client
            .request(method, url)
            .header("apikey", &self.service_key)
            .bearer_auth(&self.service_key)
    }

    async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(AgentError::Store(format!("{}: {}", status, body.trim())))
    }

    /// PATCH rows matching `filter`, returning the rows as written.
    async fn patch(&self, table: Table, filter: &Filter, fields: &Row) -> Result<Vec<Row>> {
        let response = self
            .request(Method::PATCH, &self.table_url(table))
            .query(&filter_query(filter))
            .header("Prefer", "return=representation")
            .json(fields)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }
}

/// Render equality filters in PostgREST's `column=eq.value` form.
pub fn filter_query(filter: &Filter) -> Vec<(String, String)> {
    filter
        .conditions()
        .iter()
        .map(|(column, value)| (column.clone(), format!("eq.{}", literal(value))))
        .collect()
}

fn literal(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl QueueStore for PostgrestStore {
    async fn claim_next_pending(
        &self,
        table: Table,
        user_id: &str,
        patch: Row,
    ) -> Result<Option<Row>> {
        let pending = Filter::owner(user_id).eq(STATUS_COLUMN, PENDING);
        let mut query = filter_query(&pending);
        query.push(("select".to_string(), table.primary_key().to_string()));
        query.push(("order".to_string(), format!("{}.asc", ORDER_COLUMN)));
        query.push(("limit".to_string(), CLAIM_CANDIDATES.to_string()));

        let response = self
            .request(Method::GET, &self.table_url(table))
            .query(&query)
            .send()
            .await?;
        let candidates: Vec<Row> = Self::check(response).await?.json().await?;

        for candidate in candidates {
            let Some(id) = RowId::from_row(table, &candidate) else {
                continue;
            };
            let conditional = Filter::new()
                .eq(table.primary_key(), id.to_value())
                .eq(OWNER_COLUMN, user_id)
                .eq(STATUS_COLUMN, PENDING);
            let mut written = self.patch(table, &conditional, &patch).await?;
            if written.is_empty() {
                tracing::debug!(table = %table, id = %id, "Lost claim race, trying next row");
                continue;
            }
            return Ok(Some(written.swap_remove(0)));
        }
        Ok(None)
    }

    async fn update(&self, table: Table, id: &RowId, fields: Row) -> Result<()> {
        let by_key = Filter::new().eq(table.primary_key(), id.to_value());
        let written = self.patch(table, &by_key, &fields).await?;
        if written.is_empty() {
            return Err(AgentError::RowNotFound {
                table: table.to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn replace_all(&self, table: Table, user_id: &str, rows: Vec<Row>) -> Result<()> {
        let function = format!("replace_{}", table.name());
        let body = json!({ "p_user_id": user_id, "p_rows": rows });
        let response = self
            .request(Method::POST, &self.rpc_url(&function))
            .json(&body)
            .send()
            .await
            .map_err(|e| AgentError::ReplaceNotAtomic {
                table: table.to_string(),
                reason: e.to_string(),
            })?;
        Self::check(response)
            .await
            .map_err(|e| AgentError::ReplaceNotAtomic {
                table: table.to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    async fn list(&self, table: Table, filter: &Filter) -> Result<Vec<Row>> {
        let mut query = filter_query(filter);
        query.push(("select".to_string(), "*".to_string()));
        let response = self
            .request(Method::GET, &self.table_url(table))
            .query(&query)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    #[derive(Debug, Clone)]
    struct Seen {
        head: String,
        body: String,
    }

    impl Seen {
        fn request_line(&self) -> &str {
            self.head.lines().next().unwrap_or("")
        }
    }

    /// Answer one request per connection with the canned `(status, body)`
    /// replies in order, recording what was asked.
    async fn serve(replies: Vec<(u16, &'static str)>) -> (PostgrestStore, Arc<Mutex<Vec<Seen>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        tokio::spawn(async move {
            for (status, body) in replies {
                let (mut socket, _) = listener.accept().await.unwrap();
                let request = read_request(&mut socket).await;
                log.lock().unwrap().push(request);
                let reply = format!(
                    "HTTP/1.1 {} Canned\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                socket.write_all(reply.as_bytes()).await.unwrap();
                let _ = socket.shutdown().await;
            }
        });

        let store = PostgrestStore::new(&StoreConfig {
            url: format!("http://{}", addr),
            service_key: "key".to_string(),
            request_timeout: Duration::from_secs(5),
        })
        .unwrap();
        (store, seen)
    }

    async fn read_request(socket: &mut TcpStream) -> Seen {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];
        loop {
            if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&buf[..end]).to_string();
                let len = head
                    .lines()
                    .filter_map(|line| line.split_once(':'))
                    .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
                    .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if buf.len() >= end + 4 + len {
                    let body = String::from_utf8_lossy(&buf[end + 4..end + 4 + len]).to_string();
                    return Seen { head, body };
                }
            }
            let n = socket.read(&mut chunk).await.unwrap();
            assert!(n > 0, "connection closed mid-request");
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn running() -> Row {
        let mut patch = Row::new();
        patch.insert("status".to_string(), Value::from("running"));
        patch
    }

    fn store() -> PostgrestStore {
        PostgrestStore::new(&StoreConfig {
            url: "https://example.supabase.co/".to_string(),
            service_key: "key".to_string(),
            request_timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    #[test]
    fn urls_strip_trailing_slash() {
        let store = store();
        assert_eq!(
            store.table_url(Table::JupyterSessions),
            "https://example.supabase.co/rest/v1/jupyter_sessions"
        );
        assert_eq!(
            store.rpc_url("replace_scripts"),
            "https://example.supabase.co/rest/v1/rpc/replace_scripts"
        );
    }

    #[test]
    fn filter_query_uses_eq_operator() {
        let filter = Filter::owner("u-1").eq("status", "pending").eq("job_id", 42);
        assert_eq!(
            filter_query(&filter),
            vec![
                ("user_id".to_string(), "eq.u-1".to_string()),
                ("status".to_string(), "eq.pending".to_string()),
                ("job_id".to_string(), "eq.42".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn claim_patches_conditionally_and_skips_lost_rows() {
        let (store, seen) = serve(vec![
            (200, r#"[{"job_id":"j1"},{"job_id":"j2"}]"#),
            (200, "[]"),
            (200, r#"[{"job_id":"j2","user_id":"u1","status":"running"}]"#),
        ])
        .await;

        let row = store
            .claim_next_pending(Table::Jobs, "u1", running())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row["job_id"], "j2");
        assert_eq!(row["status"], "running");

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 3);

        let select = seen[0].request_line();
        assert!(select.starts_with("GET /rest/v1/jobs?"));
        assert!(select.contains("user_id=eq.u1"));
        assert!(select.contains("status=eq.pending"));
        assert!(select.contains("order=created_at.asc"));
        assert!(select.contains("limit=5"));
        assert!(seen[0].head.to_ascii_lowercase().contains("apikey: key"));

        for (request, id) in [(&seen[1], "j1"), (&seen[2], "j2")] {
            let line = request.request_line();
            assert!(line.starts_with("PATCH /rest/v1/jobs?"));
            assert!(line.contains(&format!("job_id=eq.{}", id)));
            assert!(line.contains("user_id=eq.u1"));
            assert!(line.contains("status=eq.pending"));
            assert!(request
                .head
                .to_ascii_lowercase()
                .contains("prefer: return=representation"));
            let body: Value = serde_json::from_str(&request.body).unwrap();
            assert_eq!(body["status"], "running");
        }
    }

    #[tokio::test]
    async fn claim_is_none_when_every_candidate_is_taken() {
        let (store, seen) = serve(vec![
            (200, r#"[{"session_id":7}]"#),
            (200, "[]"),
        ])
        .await;

        let claimed = store
            .claim_next_pending(Table::JupyterSessions, "u1", Row::new())
            .await
            .unwrap();
        assert!(claimed.is_none());
        let seen = seen.lock().unwrap().clone();
        assert!(seen[1].request_line().contains("session_id=eq.7"));
    }

    #[tokio::test]
    async fn update_of_missing_row_is_row_not_found() {
        let (store, seen) = serve(vec![(200, "[]")]).await;

        let err = store
            .update(Table::Jobs, &RowId::from("gone"), running())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::RowNotFound { .. }));
        let seen = seen.lock().unwrap().clone();
        assert!(seen[0].request_line().starts_with("PATCH /rest/v1/jobs?job_id=eq.gone"));
    }

    #[tokio::test]
    async fn server_errors_are_store_errors() {
        let (store, _) = serve(vec![(503, r#"{"message":"down"}"#)]).await;

        let err = store.list(Table::Scripts, &Filter::owner("u1")).await.unwrap_err();
        assert!(matches!(&err, AgentError::Store(msg) if msg.contains("503")));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn rejected_replace_is_not_atomic_error() {
        let (store, seen) = serve(vec![(400, r#"{"message":"row not owned by u1"}"#)]).await;

        let err = store
            .replace_all(Table::Scripts, "u1", vec![running()])
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::ReplaceNotAtomic { .. }));
        let seen = seen.lock().unwrap().clone();
        assert!(seen[0]
            .request_line()
            .starts_with("POST /rest/v1/rpc/replace_scripts"));
        let body: Value = serde_json::from_str(&seen[0].body).unwrap();
        assert_eq!(body["p_user_id"], "u1");
    }
}
