//! Minimal MySQL client for the asynchronous substrate.
//!
//! Speaks just enough of the protocol for the framework's needs: the
//! handshake-v10 greeting with `mysql_native_password`, `COM_QUERY` with
//! escaped parameters, and text-protocol result sets decoded into typed
//! rows through the [`FromRow`] hook.

use std::{cell::Cell, cell::RefCell, fmt::Write as _, rc::Rc, str::FromStr};

use sha1::{Digest, Sha1};
use tracing::{debug, trace};

use strand_aio::{BufferedFd, ConnectResult, Context, Proto, RecordKind};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MysqlError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("connection lost while {0}")]
    Io(&'static str),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("login failed: {0}")]
    Auth(String),
    #[error("malformed packet: {0}")]
    Protocol(&'static str),
    #[error("server error: {0}")]
    Server(String),
}

/// Escaped SQL literal. Queries are built with `{}` placeholders bound to
/// these, so raw strings never reach the wire unquoted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlValue {
    Null,
    Int(i64),
    UInt(u64),
    Str(String),
}

impl SqlValue {
    fn render(&self, out: &mut String) {
        match self {
            SqlValue::Null => out.push_str("NULL"),
            SqlValue::Int(v) => {
                let _ = write!(out, "{v}");
            }
            SqlValue::UInt(v) => {
                let _ = write!(out, "{v}");
            }
            SqlValue::Str(v) => {
                out.push('\'');
                for c in v.chars() {
                    match c {
                        '\'' => out.push_str("\\'"),
                        '"' => out.push_str("\\\""),
                        '\\' => out.push_str("\\\\"),
                        '\n' => out.push_str("\\n"),
                        '\r' => out.push_str("\\r"),
                        '\0' => out.push_str("\\0"),
                        other => out.push(other),
                    }
                }
                out.push('\'');
            }
        }
    }
}

impl From<&str> for SqlValue {
    fn from(v: &str) -> SqlValue {
        SqlValue::Str(v.to_owned())
    }
}

impl From<String> for SqlValue {
    fn from(v: String) -> SqlValue {
        SqlValue::Str(v)
    }
}

impl From<i64> for SqlValue {
    fn from(v: i64) -> SqlValue {
        SqlValue::Int(v)
    }
}

impl From<i32> for SqlValue {
    fn from(v: i32) -> SqlValue {
        SqlValue::Int(v as i64)
    }
}

impl From<u64> for SqlValue {
    fn from(v: u64) -> SqlValue {
        SqlValue::UInt(v)
    }
}

/// Substitute each `{}` with the next escaped parameter.
pub fn bind(query: &str, params: &[SqlValue]) -> String {
    let mut out = String::with_capacity(query.len() + params.len() * 8);
    let mut params = params.iter();
    let mut rest = query;
    while let Some(pos) = rest.find("{}") {
        out.push_str(&rest[..pos]);
        match params.next() {
            Some(value) => value.render(&mut out),
            None => out.push_str("{}"),
        }
        rest = &rest[pos + 2..];
    }
    out.push_str(rest);
    out
}

/// One decoded result row; values are the text-protocol strings.
pub struct Row {
    columns: Rc<Vec<String>>,
    values: Vec<Option<String>>,
}

impl Row {
    /// Build a row by hand; lets `FromRow` implementations be exercised
    /// without a live connection.
    pub fn new(columns: Vec<String>, values: Vec<Option<String>>) -> Row {
        Row {
            columns: Rc::new(columns),
            values,
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        let index = self.columns.iter().position(|c| c == name)?;
        self.values.get(index)?.as_deref()
    }

    /// Typed access through `FromStr`; `None` for NULL, absent columns and
    /// parse failures alike.
    pub fn get_parsed<T: FromStr>(&self, name: &str) -> Option<T> {
        self.get(name)?.parse().ok()
    }
}

/// The decoding hook: entity types implement this to come out of
/// [`Mysql::select`] fully typed.
pub trait FromRow: Sized {
    fn from_row(row: &Row) -> Option<Self>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
}

struct Packet {
    data: Vec<u8>,
}

fn sha1_digest(data: &[u8]) -> Vec<u8> {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

/// `sha1(password) XOR sha1(scramble + sha1(sha1(password)))`
pub fn native_password_hash(password: &str, scramble: &[u8]) -> Vec<u8> {
    let hashed = sha1_digest(password.as_bytes());
    let double_hashed = sha1_digest(&hashed);
    let mut joined = scramble.to_vec();
    joined.extend_from_slice(&double_hashed);
    let join_hash = sha1_digest(&joined);
    hashed
        .iter()
        .zip(join_hash.iter())
        .map(|(a, b)| a ^ b)
        .collect()
}

/// Pull `(auth method, scramble)` out of the handshake-v10 greeting.
pub fn decode_handshake(packet: &[u8]) -> Result<(String, Vec<u8>), MysqlError> {
    let pivot = packet
        .iter()
        .position(|&b| b == 0)
        .ok_or(MysqlError::Protocol("handshake version"))?;
    let rest = &packet[pivot + 1..];
    if rest.len() < 32 {
        return Err(MysqlError::Protocol("handshake too short"));
    }
    let scramble1 = &rest[4..12];
    let auth_len = rest[20] as usize;
    let off = 31 + auth_len.saturating_sub(8).max(13);
    if rest.len() < off + 1 || off < 32 {
        return Err(MysqlError::Protocol("handshake auth data"));
    }
    let scramble2 = &rest[31..off - 1];
    let mut scramble = scramble1.to_vec();
    scramble.extend_from_slice(scramble2);
    let method_bytes = &rest[off..rest.len().saturating_sub(1)];
    let method = String::from_utf8_lossy(method_bytes)
        .trim_end_matches('\0')
        .to_owned();
    Ok((method, scramble))
}

fn le24(value: usize) -> [u8; 3] {
    [
        (value & 0xFF) as u8,
        ((value >> 8) & 0xFF) as u8,
        ((value >> 16) & 0xFF) as u8,
    ]
}

fn le32(value: u32) -> [u8; 4] {
    value.to_le_bytes()
}

fn read_lenenc(data: &[u8]) -> Option<(u64, &[u8])> {
    let (&first, rest) = data.split_first()?;
    match first {
        0xFC => {
            let (bytes, rest) = rest.split_at_checked(2)?;
            Some((u16::from_le_bytes(bytes.try_into().ok()?) as u64, rest))
        }
        0xFD => {
            let (bytes, rest) = rest.split_at_checked(3)?;
            Some((
                u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0]) as u64,
                rest,
            ))
        }
        0xFE => {
            let (bytes, rest) = rest.split_at_checked(8)?;
            Some((u64::from_le_bytes(bytes.try_into().ok()?), rest))
        }
        v if v < 0xFB => Some((v as u64, rest)),
        _ => None,
    }
}

fn read_lenenc_str(data: &[u8]) -> Option<(&[u8], &[u8])> {
    let (len, rest) = read_lenenc(data)?;
    rest.split_at_checked(len as usize)
}

fn is_eof(packet: &[u8]) -> bool {
    packet.first() == Some(&0xFE) && packet.len() < 9
}

pub struct Mysql {
    ctx: Rc<Context>,
    connection: RefCell<Option<Rc<BufferedFd>>>,
    authenticated: Cell<bool>,
    host: RefCell<String>,
    port: Cell<u16>,
    user: RefCell<String>,
    password: RefCell<String>,
    database: RefCell<String>,
}

impl Mysql {
    pub fn new(ctx: Rc<Context>) -> Rc<Mysql> {
        Rc::new(Mysql {
            ctx,
            connection: RefCell::new(None),
            authenticated: Cell::new(false),
            host: RefCell::new(String::new()),
            port: Cell::new(3306),
            user: RefCell::new(String::new()),
            password: RefCell::new(String::new()),
            database: RefCell::new(String::new()),
        })
    }

    pub async fn connect(
        &self,
        host: &str,
        port: u16,
        user: &str,
        password: &str,
        database: &str,
    ) -> Result<(), MysqlError> {
        *self.host.borrow_mut() = host.to_owned();
        self.port.set(port);
        *self.user.borrow_mut() = user.to_owned();
        *self.password.borrow_mut() = password.to_owned();
        *self.database.borrow_mut() = database.to_owned();
        self.reconnect().await
    }

    fn live_connection(&self) -> Option<Rc<BufferedFd>> {
        let connection = self.connection.borrow().clone()?;
        if connection.is_closed() || connection.is_error() {
            None
        } else {
            Some(connection)
        }
    }

    async fn reconnect(&self) -> Result<(), MysqlError> {
        if self.authenticated.get() && self.live_connection().is_some() {
            return Ok(());
        }
        self.authenticated.set(false);

        let host = self.host.borrow().clone();
        let conn: ConnectResult = self
            .ctx
            .clone()
            .connect(
                &host,
                RecordKind::A,
                self.port.get(),
                Proto::Tcp,
                None,
                false,
            )
            .await;
        let fd = conn
            .fd_ok()
            .ok_or_else(|| MysqlError::Connect(conn.message.clone()))?;
        *self.connection.borrow_mut() = Some(fd.clone());

        self.handshake(&fd).await
    }

    async fn handshake(&self, fd: &Rc<BufferedFd>) -> Result<(), MysqlError> {
        let greeting = self.read_packet(fd).await.ok_or(MysqlError::Io("greeting"))?;
        let (method, scramble) = decode_handshake(&greeting.data)?;
        if method != "mysql_native_password" {
            return Err(MysqlError::Handshake(format!(
                "unsupported auth method: {method}"
            )));
        }

        let auth = native_password_hash(&self.password.borrow(), &scramble);
        let mut login = Vec::with_capacity(128);
        login.extend_from_slice(&le32(0x000F_A68D)); // capability flags
        login.extend_from_slice(&le32(0x00FF_FFFF)); // max packet size
        login.push(b'-'); // charset
        login.extend_from_slice(&[0u8; 23]);
        login.extend_from_slice(self.user.borrow().as_bytes());
        login.push(0);
        login.push(auth.len() as u8);
        login.extend_from_slice(&auth);
        login.extend_from_slice(self.database.borrow().as_bytes());
        login.push(0);
        login.extend_from_slice(method.as_bytes());
        login.push(0);

        let mut framed = Vec::with_capacity(login.len() + 4);
        framed.extend_from_slice(&le24(login.len()));
        framed.push(1);
        framed.extend_from_slice(&login);
        if !fd.write(&framed).await {
            return Err(MysqlError::Io("sending login"));
        }

        let response = self.read_packet(fd).await.ok_or(MysqlError::Io("login"))?;
        match response.data.first() {
            Some(0x00) => {
                debug!("authenticated");
                self.authenticated.set(true);
                Ok(())
            }
            Some(0xFF) => Err(MysqlError::Auth(
                String::from_utf8_lossy(response.data.get(9..).unwrap_or(&[])).into_owned(),
            )),
            Some(other) => Err(MysqlError::Auth(format!("invalid return code: {other}"))),
            None => Err(MysqlError::Protocol("empty login response")),
        }
    }

    async fn read_packet(&self, fd: &Rc<BufferedFd>) -> Option<Packet> {
        let header = fd.read_n(4).await;
        if header.error {
            return None;
        }
        let length = u32::from_le_bytes([header.data[0], header.data[1], header.data[2], 0]);
        let seq = header.data[3];
        trace!(seq, length, "packet");
        let payload = fd.read_n(length as usize).await;
        if payload.error {
            return None;
        }
        Some(Packet { data: payload.data })
    }

    /// Run `query` with `params` bound and decode every row through `T`.
    pub async fn select<T: FromRow>(
        &self,
        query: &str,
        params: &[SqlValue],
    ) -> Result<Vec<T>, MysqlError> {
        let rows = self.query_rows(&bind(query, params)).await?;
        Ok(rows.iter().filter_map(T::from_row).collect())
    }

    /// Run a statement that produces no rows.
    pub async fn exec(&self, query: &str, params: &[SqlValue]) -> Result<OkPacket, MysqlError> {
        let sql = bind(query, params);
        self.reconnect().await?;
        let fd = self.live_connection().ok_or(MysqlError::Io("exec"))?;
        fd.lock().await;
        let result = self.exchange(&fd, &sql).await;
        fd.unlock();
        match result? {
            QueryOutcome::Ok(ok) => Ok(ok),
            QueryOutcome::Rows(_) => Ok(OkPacket::default()),
        }
    }

    async fn query_rows(&self, sql: &str) -> Result<Vec<Row>, MysqlError> {
        self.reconnect().await?;
        let fd = self.live_connection().ok_or(MysqlError::Io("query"))?;
        fd.lock().await;
        let result = self.exchange(&fd, sql).await;
        fd.unlock();
        match result? {
            QueryOutcome::Rows(rows) => Ok(rows),
            QueryOutcome::Ok(_) => Ok(Vec::new()),
        }
    }

    async fn exchange(&self, fd: &Rc<BufferedFd>, sql: &str) -> Result<QueryOutcome, MysqlError> {
        trace!(sql, "query");
        let mut framed = Vec::with_capacity(sql.len() + 5);
        framed.extend_from_slice(&le24(sql.len() + 1));
        framed.push(0);
        framed.push(0x03); // COM_QUERY
        framed.extend_from_slice(sql.as_bytes());
        if !fd.write(&framed).await {
            self.authenticated.set(false);
            return Err(MysqlError::Io("sending query"));
        }

        let first = self.read_packet(fd).await.ok_or_else(|| {
            self.authenticated.set(false);
            MysqlError::Io("query response")
        })?;
        match first.data.first() {
            Some(0x00) => {
                let rest = &first.data[1..];
                let (affected_rows, rest) =
                    read_lenenc(rest).ok_or(MysqlError::Protocol("ok affected rows"))?;
                let (last_insert_id, _) =
                    read_lenenc(rest).ok_or(MysqlError::Protocol("ok insert id"))?;
                Ok(QueryOutcome::Ok(OkPacket {
                    affected_rows,
                    last_insert_id,
                }))
            }
            Some(0xFF) => Err(MysqlError::Server(
                String::from_utf8_lossy(first.data.get(9..).unwrap_or(&[])).into_owned(),
            )),
            Some(_) => {
                let (column_count, _) =
                    read_lenenc(&first.data).ok_or(MysqlError::Protocol("column count"))?;
                self.read_resultset(fd, column_count as usize).await
            }
            None => Err(MysqlError::Protocol("empty query response")),
        }
    }

    async fn read_resultset(
        &self,
        fd: &Rc<BufferedFd>,
        column_count: usize,
    ) -> Result<QueryOutcome, MysqlError> {
        let mut columns = Vec::with_capacity(column_count);
        for _ in 0..column_count {
            let definition = self
                .read_packet(fd)
                .await
                .ok_or(MysqlError::Io("column definition"))?;
            columns.push(column_name(&definition.data)?);
        }
        let eof = self.read_packet(fd).await.ok_or(MysqlError::Io("eof"))?;
        if !is_eof(&eof.data) {
            return Err(MysqlError::Protocol("missing eof after columns"));
        }

        let columns = Rc::new(columns);
        let mut rows = Vec::new();
        loop {
            let packet = self.read_packet(fd).await.ok_or(MysqlError::Io("row"))?;
            if is_eof(&packet.data) {
                break;
            }
            if packet.data.first() == Some(&0xFF) {
                return Err(MysqlError::Server(
                    String::from_utf8_lossy(packet.data.get(9..).unwrap_or(&[])).into_owned(),
                ));
            }
            let mut values = Vec::with_capacity(column_count);
            let mut rest: &[u8] = &packet.data;
            for _ in 0..column_count {
                if rest.first() == Some(&0xFB) {
                    values.push(None);
                    rest = &rest[1..];
                } else {
                    let (value, tail) =
                        read_lenenc_str(rest).ok_or(MysqlError::Protocol("row value"))?;
                    values.push(Some(String::from_utf8_lossy(value).into_owned()));
                    rest = tail;
                }
            }
            rows.push(Row {
                columns: columns.clone(),
                values,
            });
        }
        Ok(QueryOutcome::Rows(rows))
    }
}

enum QueryOutcome {
    Ok(OkPacket),
    Rows(Vec<Row>),
}

/// Column definitions carry `catalog, schema, table, org_table, name, …` as
/// length-encoded strings; only the name matters here.
fn column_name(definition: &[u8]) -> Result<String, MysqlError> {
    let mut rest = definition;
    for _ in 0..4 {
        let (_, tail) = read_lenenc_str(rest).ok_or(MysqlError::Protocol("column definition"))?;
        rest = tail;
    }
    let (name, _) = read_lenenc_str(rest).ok_or(MysqlError::Protocol("column name"))?;
    Ok(String::from_utf8_lossy(name).into_owned())
}
