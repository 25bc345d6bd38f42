//! Database connectivity checks.
//!
//! MySQL, PostgreSQL and SQLite get a real driver connection, a ping and a
//! version query. DynamoDB is checked for reachability of its regional
//! endpoint only, so a success there is reported as reachable rather than
//! connected.

use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use sqlx::mysql::{MySqlConnectOptions, MySqlConnection};
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection};
use sqlx::Connection;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::info;

use crate::models::{DatabaseRequest, DatabaseResponse};

pub const CHECK_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_DYNAMODB_REGION: &str = "us-east-1";

/// Engines whose check cannot verify credentials.
const REACHABILITY_ONLY: &[&str] = &["dynamodb"];

impl DatabaseRequest {
    /// Rejects requests with a missing engine or connection string.
    pub fn validate(&self) -> Result<(), DatabaseResponse> {
        if self.engine.trim().is_empty() {
            return Err(DatabaseResponse {
                success: false,
                message: "Engine field is required".to_string(),
                engine: String::new(),
            });
        }
        if self.connection_string.trim().is_empty() {
            return Err(DatabaseResponse {
                success: false,
                message: "Connection string field is required".to_string(),
                engine: self.engine.clone(),
            });
        }
        Ok(())
    }
}

impl DatabaseResponse {
    /// Text recorded in `LoadStatus::database_status`.
    pub fn status_line(&self) -> String {
        match (self.success, REACHABILITY_ONLY.contains(&self.engine.as_str())) {
            (true, false) => format!("{}: Connected", self.engine),
            (true, true) => format!("{}: Reachable", self.engine),
            (false, _) => format!("{}: Failed - {}", self.engine, self.message),
        }
    }
}

pub async fn check_connection(engine: &str, connection_string: &str) -> DatabaseResponse {
    let outcome = match engine {
        "mysql" => within_timeout("MySQL", check_mysql(connection_string)).await,
        "postgres" => within_timeout("PostgreSQL", check_postgres(connection_string)).await,
        "sqlite" => within_timeout("SQLite", check_sqlite(connection_string)).await,
        "dynamodb" => {
            let region = match connection_string.trim() {
                "" => DEFAULT_DYNAMODB_REGION,
                region => region,
            };
            reach_endpoint("DynamoDB", &format!("dynamodb.{region}.amazonaws.com:443")).await
        }
        other => Err(format!(
            "Unsupported database engine: {other}. \
             Supported engines: mysql, postgres, sqlite, dynamodb"
        )),
    };

    let (success, message) = match outcome {
        Ok(message) => (true, message),
        Err(message) => (false, message),
    };
    let response = DatabaseResponse {
        success,
        message,
        engine: engine.to_string(),
    };
    info!(
        engine,
        success = response.success,
        message = %response.message,
        "database connection test"
    );
    response
}

async fn within_timeout(
    label: &str,
    check: impl Future<Output = Result<String, String>>,
) -> Result<String, String> {
    timeout(CHECK_TIMEOUT, check).await.unwrap_or_else(|_| {
        Err(format!(
            "Failed to connect to {label}: timed out after {}s",
            CHECK_TIMEOUT.as_secs()
        ))
    })
}

async fn check_mysql(connection_string: &str) -> Result<String, String> {
    let options = mysql_options(connection_string)?;
    let mut conn = MySqlConnection::connect_with(&options)
        .await
        .map_err(|err| format!("Failed to open MySQL connection: {err}"))?;
    conn.ping()
        .await
        .map_err(|err| format!("Failed to ping MySQL database: {err}"))?;
    let version: String = sqlx::query_scalar("SELECT VERSION()")
        .fetch_one(&mut conn)
        .await
        .map_err(|err| format!("Failed to query MySQL version: {err}"))?;
    let _ = conn.close().await;
    Ok(format!("Successfully connected to MySQL. Version: {version}"))
}

async fn check_postgres(connection_string: &str) -> Result<String, String> {
    let options = postgres_options(connection_string)?;
    let mut conn = PgConnection::connect_with(&options)
        .await
        .map_err(|err| format!("Failed to open PostgreSQL connection: {err}"))?;
    conn.ping()
        .await
        .map_err(|err| format!("Failed to ping PostgreSQL database: {err}"))?;
    let version: String = sqlx::query_scalar("SELECT version()")
        .fetch_one(&mut conn)
        .await
        .map_err(|err| format!("Failed to query PostgreSQL version: {err}"))?;
    let _ = conn.close().await;
    let version: String = version.chars().take(100).collect();
    Ok(format!("Successfully connected to PostgreSQL. Version: {version}"))
}

async fn check_sqlite(connection_string: &str) -> Result<String, String> {
    let options = sqlite_options(connection_string)?;
    let mut conn = SqliteConnection::connect_with(&options)
        .await
        .map_err(|err| format!("Failed to open SQLite connection: {err}"))?;
    conn.ping()
        .await
        .map_err(|err| format!("Failed to ping SQLite database: {err}"))?;
    let version: String = sqlx::query_scalar("SELECT sqlite_version()")
        .fetch_one(&mut conn)
        .await
        .map_err(|err| format!("Failed to query SQLite version: {err}"))?;
    let _ = conn.close().await;
    Ok(format!("Successfully connected to SQLite. Version: {version}"))
}

async fn reach_endpoint(label: &str, addr: &str) -> Result<String, String> {
    match timeout(CHECK_TIMEOUT, TcpStream::connect(addr)).await {
        Ok(Ok(_stream)) => Ok(format!(
            "{label} endpoint {addr} is reachable (credentials not verified)"
        )),
        Ok(Err(err)) => Err(format!("Failed to connect to {label} at {addr}: {err}")),
        Err(_) => Err(format!(
            "Failed to connect to {label} at {addr}: timed out after {}s",
            CHECK_TIMEOUT.as_secs()
        )),
    }
}

/// Connection parameters pulled out of a non-URL connection string.
#[derive(Debug, Default, PartialEq, Eq)]
struct Dsn {
    host: String,
    port: Option<u16>,
    user: Option<String>,
    password: Option<String>,
    database: Option<String>,
}

fn mysql_options(connection: &str) -> Result<MySqlConnectOptions, String> {
    let connection = connection.trim();
    if connection.contains("://") {
        return MySqlConnectOptions::from_str(connection)
            .map_err(|err| format!("Failed to parse MySQL connection string: {err}"));
    }
    let dsn = parse_mysql_dsn(connection)
        .ok_or_else(|| "Failed to parse MySQL connection string".to_string())?;
    let mut options = MySqlConnectOptions::new()
        .host(&dsn.host)
        .port(dsn.port.unwrap_or(3306));
    if let Some(user) = &dsn.user {
        options = options.username(user);
    }
    if let Some(password) = &dsn.password {
        options = options.password(password);
    }
    if let Some(database) = &dsn.database {
        options = options.database(database);
    }
    Ok(options)
}

fn postgres_options(connection: &str) -> Result<PgConnectOptions, String> {
    let connection = connection.trim();
    if connection.contains("://") {
        return PgConnectOptions::from_str(connection)
            .map_err(|err| format!("Failed to parse PostgreSQL connection string: {err}"));
    }
    let dsn = parse_key_value(connection)
        .ok_or_else(|| "Failed to parse PostgreSQL connection string".to_string())?;
    let mut options = PgConnectOptions::new()
        .host(&dsn.host)
        .port(dsn.port.unwrap_or(5432));
    if let Some(user) = &dsn.user {
        options = options.username(user);
    }
    if let Some(password) = &dsn.password {
        options = options.password(password);
    }
    if let Some(database) = &dsn.database {
        options = options.database(database);
    }
    Ok(options)
}

/// Never creates the file: a missing database is a failure.
fn sqlite_options(connection: &str) -> Result<SqliteConnectOptions, String> {
    let connection = connection.trim();
    let options = if connection.starts_with("sqlite:") {
        SqliteConnectOptions::from_str(connection)
            .map_err(|err| format!("Failed to parse SQLite connection string: {err}"))?
    } else {
        let path = connection.strip_prefix("file:").unwrap_or(connection);
        let path = path.split('?').next().unwrap_or(path);
        SqliteConnectOptions::new().filename(path)
    };
    Ok(options.create_if_missing(false))
}

/// Parses `[user[:password]@][tcp(host[:port])]/[dbname][?params]`.
fn parse_mysql_dsn(dsn: &str) -> Option<Dsn> {
    let (head, tail) = dsn.rsplit_once('/')?;
    let database = tail
        .split('?')
        .next()
        .filter(|db| !db.is_empty())
        .map(str::to_string);

    let (credentials, address) = match head.rsplit_once('@') {
        Some((credentials, address)) => (Some(credentials), address),
        None => (None, head),
    };
    let (user, password) = match credentials {
        Some(credentials) => match credentials.split_once(':') {
            Some((user, password)) => (Some(user.to_string()), Some(password.to_string())),
            None => (Some(credentials.to_string()), None),
        },
        None => (None, None),
    };

    let (host, port) = if address.is_empty() {
        ("127.0.0.1".to_string(), None)
    } else {
        let inner = address.strip_prefix("tcp(")?.strip_suffix(')')?;
        split_host_port(inner)?
    };

    Some(Dsn {
        host,
        port,
        user: user.filter(|u| !u.is_empty()),
        password,
        database,
    })
}

/// Parses libpq `key=value` pairs. Quoted values are not supported.
fn parse_key_value(connection: &str) -> Option<Dsn> {
    let mut dsn = Dsn {
        host: "localhost".to_string(),
        ..Dsn::default()
    };
    for pair in connection.split_whitespace() {
        let (key, value) = pair.split_once('=')?;
        match key {
            "host" => dsn.host = value.to_string(),
            "port" => dsn.port = Some(value.parse().ok()?),
            "user" => dsn.user = Some(value.to_string()),
            "password" => dsn.password = Some(value.to_string()),
            "dbname" => dsn.database = Some(value.to_string()),
            _ => {}
        }
    }
    Some(dsn)
}

fn split_host_port(authority: &str) -> Option<(String, Option<u16>)> {
    if authority.is_empty() {
        return None;
    }
    if let Some(v6) = authority.strip_prefix('[') {
        let (host, rest) = v6.split_once(']')?;
        let port = match rest.strip_prefix(':') {
            Some(port) => Some(port.parse().ok()?),
            None => None,
        };
        return Some((host.to_string(), port));
    }
    match authority.rsplit_once(':') {
        Some((host, port)) => Some((host.to_string(), Some(port.parse().ok()?))),
        None => Some((authority.to_string(), None)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mysql_dsn_is_split_into_parts() {
        assert_eq!(
            parse_mysql_dsn("app:s3cret@tcp(db.local:3307)/orders?parseTime=true"),
            Some(Dsn {
                host: "db.local".into(),
                port: Some(3307),
                user: Some("app".into()),
                password: Some("s3cret".into()),
                database: Some("orders".into()),
            })
        );
        let bare = parse_mysql_dsn("root@/").unwrap();
        assert_eq!(bare.host, "127.0.0.1");
        assert_eq!(bare.user.as_deref(), Some("root"));
        assert_eq!(bare.database, None);
        assert_eq!(parse_mysql_dsn("no-slash-here"), None);
        assert_eq!(parse_mysql_dsn("u@unix(/tmp/mysql.sock)/db"), None);
    }

    #[test]
    fn key_value_string_is_split_into_parts() {
        let dsn = parse_key_value(
            "host=10.0.0.5 port=6543 user=app password=pw dbname=x sslmode=disable",
        )
        .unwrap();
        assert_eq!(dsn.host, "10.0.0.5");
        assert_eq!(dsn.port, Some(6543));
        assert_eq!(dsn.password.as_deref(), Some("pw"));
        assert_eq!(dsn.database.as_deref(), Some("x"));
        assert_eq!(parse_key_value("host=a port=http"), None);
    }

    #[test]
    fn ipv6_hosts_keep_their_port() {
        assert_eq!(
            split_host_port("[::1]:5433"),
            Some(("::1".to_string(), Some(5433)))
        );
        assert_eq!(split_host_port("[::1]"), Some(("::1".to_string(), None)));
        assert_eq!(split_host_port(""), None);
    }

    #[test]
    fn status_line_reflects_outcome() {
        let ok = DatabaseResponse {
            success: true,
            message: "fine".into(),
            engine: "mysql".into(),
        };
        assert_eq!(ok.status_line(), "mysql: Connected");
        let reachable = DatabaseResponse {
            engine: "dynamodb".into(),
            ..ok.clone()
        };
        assert_eq!(reachable.status_line(), "dynamodb: Reachable");
        let failed = DatabaseResponse {
            success: false,
            ..ok
        };
        assert_eq!(failed.status_line(), "mysql: Failed - fine");
    }

    #[test]
    fn validation_requires_both_fields() {
        let missing_engine = DatabaseRequest::default();
        assert_eq!(
            missing_engine.validate().unwrap_err().message,
            "Engine field is required"
        );
        let missing_conn = DatabaseRequest {
            engine: "postgres".into(),
            connection_string: " ".into(),
        };
        let err = missing_conn.validate().unwrap_err();
        assert_eq!(err.message, "Connection string field is required");
        assert_eq!(err.engine, "postgres");
    }

    #[tokio::test]
    async fn unsupported_engine_fails() {
        let response = check_connection("oracle", "whatever").await;
        assert!(!response.success);
        assert!(response.message.starts_with("Unsupported database engine: oracle"));
    }

    #[tokio::test]
    async fn open_port_without_postgres_is_not_connected() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                drop(socket);
            }
        });

        let response = check_connection("postgres", &format!("postgres://app:pw@{addr}/db")).await;
        assert!(!response.success, "{}", response.message);
        assert!(response.message.starts_with("Failed to"), "{}", response.message);
        assert!(response.status_line().starts_with("postgres: Failed - "));
    }

    #[tokio::test]
    async fn sqlite_needs_existing_file() {
        let response = check_connection("sqlite", "/nonexistent/loadsim-missing.db").await;
        assert!(!response.success);
        assert!(response.message.starts_with("Failed to open SQLite connection"));
    }

    #[tokio::test]
    async fn sqlite_reports_version() {
        let path = std::env::temp_dir().join(format!("loadsim-{}.db", uuid::Uuid::new_v4()));
        std::fs::File::create(&path).unwrap();

        let response = check_connection("sqlite", path.to_str().unwrap()).await;
        std::fs::remove_file(&path).unwrap();
        assert!(response.success, "{}", response.message);
        assert!(response.message.contains("Version: 3."), "{}", response.message);
        assert_eq!(response.status_line(), "sqlite: Connected");
    }
}
