//! Scripted MySQL-protocol server for integration tests.
//!
//! Speaks just enough of the protocol to exercise the client: a
//! `mysql_native_password` greeting without TLS, text and prepared
//! statements, and a handful of canned queries:
//!
//! - `SELECT @@max_allowed_packet, @@wait_timeout`: `16777216`, `28800`
//! - `SELECT @@memsql_version`: `7.8.19` unless changed with `set_version`
//! - `SELECT SLEEP(n)`: waits `n` seconds unless the session is killed
//! - `SELECT * FROM seq_n`: rows `1..=n` in one column
//! - `SELECT x`: one row with the text `x`
//! - `INSERT INTO t VALUES (n)`: fails with 1062 if `n` was inserted before
//! - `DO ...`: OK with one warning
//! - `BEGIN` / `COMMIT` / `ROLLBACK` and `set autocommit=0|1` track status flags
//! - `KILL [QUERY] id`: interrupts the sleep of session `id`
//! - `LOAD DATA LOCAL INFILE 'f' ...` and `CALL fetch_file('f')`: ask the
//!   client for `f`, then report one affected row per received line
//! - any query containing `crash` drops the connection the first time it is seen
//! - any query starting with `fail` is a syntax error
//!
//! Every command is logged with the session id that received it.

#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap, HashSet};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use zero_singlestore::Opts;

const CLIENT_LONG_PASSWORD: u32 = 0x0000_0001;
const CLIENT_LONG_FLAG: u32 = 0x0000_0004;
const CLIENT_CONNECT_WITH_DB: u32 = 0x0000_0008;
const CLIENT_LOCAL_FILES: u32 = 0x0000_0080;
const CLIENT_PROTOCOL_41: u32 = 0x0000_0200;
const CLIENT_TRANSACTIONS: u32 = 0x0000_2000;
const CLIENT_SECURE_CONNECTION: u32 = 0x0000_8000;
const CLIENT_MULTI_RESULTS: u32 = 0x0002_0000;
const CLIENT_PS_MULTI_RESULTS: u32 = 0x0004_0000;
const CLIENT_PLUGIN_AUTH: u32 = 0x0008_0000;
const CLIENT_CONNECT_ATTRS: u32 = 0x0010_0000;
const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: u32 = 0x0020_0000;

const STATUS_IN_TRANS: u16 = 0x0001;
const STATUS_AUTOCOMMIT: u16 = 0x0002;

const TYPE_VAR_STRING: u8 = 253;

pub const FIRST_THREAD_ID: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Logged {
    pub thread_id: u32,
    pub command: String,
}

#[derive(Default)]
struct Shared {
    next_thread: AtomicU32,
    next_statement: AtomicU32,
    log: Mutex<Vec<Logged>>,
    table: Mutex<BTreeSet<i64>>,
    statements: Mutex<HashMap<u32, String>>,
    killed: Mutex<HashSet<u32>>,
    crashed: Mutex<HashSet<String>>,
    version: Mutex<String>,
}

pub struct MockServer {
    addr: SocketAddr,
    shared: Arc<Shared>,
}

impl MockServer {
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let shared = Arc::new(Shared::default());
        shared.next_thread.store(FIRST_THREAD_ID, Ordering::SeqCst);
        shared.next_statement.store(1, Ordering::SeqCst);
        *shared.version.lock().unwrap() = "7.8.19".into();

        let accept_shared = Arc::clone(&shared);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { return };
                let shared = Arc::clone(&accept_shared);
                thread::spawn(move || {
                    let _ = Session::new(stream, shared).serve();
                });
            }
        });
        Self { addr, shared }
    }

    pub fn opts(&self) -> Opts {
        Opts {
            host: "127.0.0.1".into(),
            port: self.addr.port(),
            user: "root".into(),
            password: Some("secret".into()),
            ..Opts::default()
        }
    }

    pub fn log(&self) -> Vec<Logged> {
        self.shared.log.lock().unwrap().clone()
    }

    /// Commands received by one session, in order.
    pub fn commands_of(&self, thread_id: u32) -> Vec<String> {
        self.log()
            .into_iter()
            .filter(|entry| entry.thread_id == thread_id)
            .map(|entry| entry.command)
            .collect()
    }

    /// Value of `@@memsql_version`.
    pub fn set_version(&self, version: &str) {
        *self.shared.version.lock().unwrap() = version.into();
    }

    pub fn saw(&self, command: &str) -> bool {
        self.log().iter().any(|entry| entry.command == command)
    }
}

struct Session {
    stream: TcpStream,
    shared: Arc<Shared>,
    thread_id: u32,
    status: u16,
}

impl Session {
    fn new(stream: TcpStream, shared: Arc<Shared>) -> Self {
        let thread_id = shared.next_thread.fetch_add(1, Ordering::SeqCst);
        Self {
            stream,
            shared,
            thread_id,
            status: STATUS_AUTOCOMMIT,
        }
    }

    fn serve(mut self) -> std::io::Result<()> {
        self.write_packets(0, &[greeting(self.thread_id)])?;
        let (seq, response) = self.read_packet()?;
        let user = handshake_user(&response);
        self.log(format!("CONNECT {user}"));
        if user.starts_with("expired") {
            let denied = err(1045, "28000", "Access denied: token expired");
            return self.write_packets(seq.wrapping_add(1), &[denied]);
        }
        let ok = self.ok(0, 0);
        self.write_packets(seq.wrapping_add(1), &[ok])?;

        loop {
            let (_, payload) = self.read_packet()?;
            let Some((&command, body)) = payload.split_first() else {
                return Ok(());
            };
            let replies = match command {
                0x01 => {
                    self.log("COM_QUIT".into());
                    return Ok(());
                }
                0x02 => {
                    self.log(format!("COM_INIT_DB {}", String::from_utf8_lossy(body)));
                    vec![self.ok(0, 0)]
                }
                0x03 => {
                    let sql = String::from_utf8_lossy(body).into_owned();
                    self.log(sql.clone());
                    if let Some(name) = requested_file(&sql) {
                        self.local_infile(&name)?;
                        continue;
                    }
                    match self.query(&sql) {
                        Some(replies) => replies,
                        None => return Ok(()),
                    }
                }
                0x0e => {
                    self.log("COM_PING".into());
                    vec![self.ok(0, 0)]
                }
                0x16 => self.prepare(String::from_utf8_lossy(body).into_owned()),
                0x17 => self.execute(body),
                0x19 => {
                    let id = u32::from_le_bytes(body[..4].try_into().unwrap());
                    self.log(format!("COM_STMT_CLOSE {id}"));
                    continue;
                }
                0x1f => {
                    self.log("COM_RESET_CONNECTION".into());
                    self.status = STATUS_AUTOCOMMIT;
                    vec![self.ok(0, 0)]
                }
                other => vec![err(1047, "08S01", &format!("unknown command {other}"))],
            };
            self.write_packets(1, &replies)?;
        }
    }

    fn log(&self, command: String) {
        self.shared.log.lock().unwrap().push(Logged {
            thread_id: self.thread_id,
            command,
        });
    }

    /// Replies for a text query; `None` drops the connection.
    fn query(&mut self, sql: &str) -> Option<Vec<Vec<u8>>> {
        let lower = sql.trim().to_ascii_lowercase();
        if lower.contains("crash") && self.shared.crashed.lock().unwrap().insert(lower.clone()) {
            return None;
        }

        let replies = if lower.starts_with("select @@max_allowed_packet") {
            self.result_set(&["@@max_allowed_packet", "@@wait_timeout"], &[&["16777216", "28800"]])
        } else if lower == "select @@memsql_version" {
            let version = self.shared.version.lock().unwrap().clone();
            self.result_set(&["@@memsql_version"], &[&[version.as_str()]])
        } else if let Some(rest) = lower.strip_prefix("select sleep(") {
            let seconds: u64 = rest.trim_end_matches(')').parse().unwrap_or(0);
            self.sleep(Duration::from_secs(seconds))
        } else if let Some(count) = lower.strip_prefix("select * from seq_") {
            let count: usize = count.parse().unwrap_or(0);
            let values: Vec<String> = (1..=count).map(|i| i.to_string()).collect();
            let rows: Vec<[&str; 1]> = values.iter().map(|v| [v.as_str()]).collect();
            let rows: Vec<&[&str]> = rows.iter().map(|r| r.as_slice()).collect();
            self.result_set(&["n"], &rows)
        } else if let Some(value) = sql.trim().strip_prefix("SELECT ") {
            self.result_set(&["v"], &[&[value]])
        } else if let Some(rest) = lower.strip_prefix("insert into t values (") {
            let value = rest.trim_end_matches(')').parse().unwrap_or(0);
            vec![self.insert(value)]
        } else if lower.starts_with("do ") {
            vec![self.ok(0, 1)]
        } else if lower == "begin" || lower == "start transaction" {
            self.status |= STATUS_IN_TRANS;
            vec![self.ok(0, 0)]
        } else if lower == "commit" || lower == "rollback" {
            self.status &= !STATUS_IN_TRANS;
            vec![self.ok(0, 0)]
        } else if lower == "set autocommit=0" {
            self.status &= !STATUS_AUTOCOMMIT;
            vec![self.ok(0, 0)]
        } else if lower == "set autocommit=1" {
            self.status |= STATUS_AUTOCOMMIT;
            vec![self.ok(0, 0)]
        } else if let Some(id) = lower
            .strip_prefix("kill query ")
            .or_else(|| lower.strip_prefix("kill "))
        {
            let id: u32 = id.trim().parse().unwrap_or(0);
            self.shared.killed.lock().unwrap().insert(id);
            vec![self.ok(0, 0)]
        } else if lower.starts_with("update ") {
            vec![self.ok(1, 0)]
        } else if lower.starts_with("fail") {
            vec![err(1064, "42000", "You have an error in your SQL syntax")]
        } else {
            vec![self.ok(0, 0)]
        };
        Some(replies)
    }

    /// Ask the client for `name` and read the upload up to its empty packet.
    fn local_infile(&mut self, name: &str) -> std::io::Result<()> {
        let mut request = vec![0xfb];
        request.extend_from_slice(name.as_bytes());
        self.write_packets(1, &[request])?;

        let mut received = Vec::new();
        let seq = loop {
            let (seq, payload) = self.read_packet()?;
            if payload.is_empty() {
                break seq;
            }
            received.extend_from_slice(&payload);
        };
        self.log(format!("LOCAL INFILE {name} {} bytes", received.len()));
        let lines = received.iter().filter(|&&b| b == b'\n').count();
        let ok = self.ok(lines as u8, 0);
        self.write_packets(seq.wrapping_add(1), &[ok])
    }

    fn sleep(&mut self, duration: Duration) -> Vec<Vec<u8>> {
        let deadline = Instant::now() + duration;
        while Instant::now() < deadline {
            if self.shared.killed.lock().unwrap().remove(&self.thread_id) {
                return vec![err(1317, "70100", "Query execution was interrupted")];
            }
            thread::sleep(Duration::from_millis(20));
        }
        self.result_set(&["sleep"], &[&["0"]])
    }

    fn insert(&mut self, value: i64) -> Vec<u8> {
        if self.shared.table.lock().unwrap().insert(value) {
            self.ok(1, 0)
        } else {
            err(1062, "23000", &format!("Duplicate entry '{value}' for key 'PRIMARY'"))
        }
    }

    fn prepare(&mut self, sql: String) -> Vec<Vec<u8>> {
        self.log(format!("PREPARE {sql}"));
        let id = self.shared.next_statement.fetch_add(1, Ordering::SeqCst);
        let params = sql.matches('?').count() as u16;
        self.shared.statements.lock().unwrap().insert(id, sql);

        let mut head = vec![0x00];
        head.extend_from_slice(&id.to_le_bytes());
        head.extend_from_slice(&0_u16.to_le_bytes());
        head.extend_from_slice(&params.to_le_bytes());
        head.push(0);
        head.extend_from_slice(&0_u16.to_le_bytes());

        let mut replies = vec![head];
        if params > 0 {
            for _ in 0..params {
                replies.push(column("?"));
            }
            replies.push(self.eof());
        }
        replies
    }

    fn execute(&mut self, body: &[u8]) -> Vec<Vec<u8>> {
        let id = u32::from_le_bytes(body[..4].try_into().unwrap());
        let Some(sql) = self.shared.statements.lock().unwrap().get(&id).cloned() else {
            return vec![err(1243, "HY000", "Unknown prepared statement handler")];
        };
        self.log(format!("EXECUTE {id} {sql}"));
        // id, flags, iteration count, one-byte null bitmap, bound flag, one type
        let value = body
            .get(4 + 1 + 4 + 1 + 1 + 2..)
            .and_then(|v| v.get(..8))
            .map(|v| i64::from_le_bytes(v.try_into().unwrap()))
            .unwrap_or(0);
        if sql.to_ascii_lowercase().starts_with("insert") {
            vec![self.insert(value)]
        } else {
            vec![self.ok(0, 0)]
        }
    }

    fn ok(&self, affected_rows: u8, warnings: u16) -> Vec<u8> {
        let mut out = vec![0x00, affected_rows, 0x00];
        out.extend_from_slice(&self.status.to_le_bytes());
        out.extend_from_slice(&warnings.to_le_bytes());
        out
    }

    fn eof(&self) -> Vec<u8> {
        let mut out = vec![0xfe, 0, 0];
        out.extend_from_slice(&self.status.to_le_bytes());
        out
    }

    fn result_set(&self, columns: &[&str], rows: &[&[&str]]) -> Vec<Vec<u8>> {
        let mut replies = vec![vec![columns.len() as u8]];
        replies.extend(columns.iter().map(|name| column(name)));
        replies.push(self.eof());
        for row in rows {
            let mut out = Vec::new();
            for cell in *row {
                lenenc_bytes(&mut out, cell.as_bytes());
            }
            replies.push(out);
        }
        replies.push(self.eof());
        replies
    }

    fn read_packet(&mut self) -> std::io::Result<(u8, Vec<u8>)> {
        let mut header = [0_u8; 4];
        self.stream.read_exact(&mut header)?;
        let len = usize::from(header[0]) | usize::from(header[1]) << 8 | usize::from(header[2]) << 16;
        let mut payload = vec![0_u8; len];
        self.stream.read_exact(&mut payload)?;
        Ok((header[3], payload))
    }

    fn write_packets(&mut self, first_seq: u8, payloads: &[Vec<u8>]) -> std::io::Result<()> {
        let mut out = Vec::new();
        let mut seq = first_seq;
        for payload in payloads {
            let len = payload.len() as u32;
            out.extend_from_slice(&len.to_le_bytes()[..3]);
            out.push(seq);
            out.extend_from_slice(payload);
            seq = seq.wrapping_add(1);
        }
        self.stream.write_all(&out)?;
        self.stream.flush()
    }
}

fn greeting(thread_id: u32) -> Vec<u8> {
    let capabilities = CLIENT_LONG_PASSWORD
        | CLIENT_LONG_FLAG
        | CLIENT_CONNECT_WITH_DB
        | CLIENT_LOCAL_FILES
        | CLIENT_PROTOCOL_41
        | CLIENT_TRANSACTIONS
        | CLIENT_SECURE_CONNECTION
        | CLIENT_MULTI_RESULTS
        | CLIENT_PS_MULTI_RESULTS
        | CLIENT_PLUGIN_AUTH
        | CLIENT_CONNECT_ATTRS
        | CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA;
    let mut out = vec![10];
    out.extend_from_slice(b"8.0.32-SingleStore\0");
    out.extend_from_slice(&thread_id.to_le_bytes());
    out.extend_from_slice(b"abcdefgh\0");
    out.extend_from_slice(&((capabilities & 0xffff) as u16).to_le_bytes());
    out.push(45);
    out.extend_from_slice(&STATUS_AUTOCOMMIT.to_le_bytes());
    out.extend_from_slice(&((capabilities >> 16) as u16).to_le_bytes());
    out.push(21);
    out.extend_from_slice(&[0; 10]);
    out.extend_from_slice(b"ijklmnopqrst\0");
    out.extend_from_slice(b"mysql_native_password\0");
    out
}

/// File a query makes the server ask for.
fn requested_file(sql: &str) -> Option<String> {
    let lower = sql.trim().to_ascii_lowercase();
    let prefix = ["load data local infile '", "call fetch_file('"]
        .into_iter()
        .find(|prefix| lower.starts_with(prefix))?;
    let rest = &sql.trim()[prefix.len()..];
    let end = rest.find('\'')?;
    Some(rest[..end].to_owned())
}

/// User name from a HandshakeResponse41.
fn handshake_user(payload: &[u8]) -> String {
    let user = payload.get(32..).unwrap_or_default();
    let end = user.iter().position(|&b| b == 0).unwrap_or(user.len());
    String::from_utf8_lossy(&user[..end]).into_owned()
}

fn column(name: &str) -> Vec<u8> {
    let mut out = Vec::new();
    for s in ["def", "db", "t", "t", name, name] {
        lenenc_bytes(&mut out, s.as_bytes());
    }
    out.push(0x0c);
    out.extend_from_slice(&45_u16.to_le_bytes());
    out.extend_from_slice(&255_u32.to_le_bytes());
    out.push(TYPE_VAR_STRING);
    out.extend_from_slice(&0_u16.to_le_bytes());
    out.push(0);
    out.extend_from_slice(&[0, 0]);
    out
}

fn err(code: u16, sql_state: &str, message: &str) -> Vec<u8> {
    let mut out = vec![0xff];
    out.extend_from_slice(&code.to_le_bytes());
    out.push(b'#');
    out.extend_from_slice(sql_state.as_bytes());
    out.extend_from_slice(message.as_bytes());
    out
}

fn lenenc_bytes(out: &mut Vec<u8>, data: &[u8]) {
    assert!(data.len() < 251);
    out.push(data.len() as u8);
    out.extend_from_slice(data);
}

/// An unsigned JWT expiring in an hour.
pub fn jwt() -> String {
    use base64::Engine;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;

    let exp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs()
        + 3600;
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none"}"#);
    let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"exp":{exp},"sub":"u"}}"#));
    format!("{header}.{payload}.sig")
}
