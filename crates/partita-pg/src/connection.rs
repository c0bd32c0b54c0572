//! Blocking PgConnection: connects, authenticates, and queries PostgreSQL.
//!
//! Every request is written in one batch and its replies are read up to
//! the closing ReadyForQuery, so the connection is always idle and in
//! sync between calls. Any I/O or framing failure marks the connection
//! broken; a broken connection refuses further work.

use std::io::{BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;
use tracing::{debug, trace};

use partita_core::Endpoint;

use crate::auth::ScramClient;
use crate::codec;
use crate::error::{PgError, PgResult};
use crate::protocol::*;

/// One result row in text format. `None` is SQL NULL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    values: Vec<Option<String>>,
}

impl Row {
    pub fn new(values: Vec<Option<String>>) -> Self {
        Self { values }
    }

    /// Column `idx` as text; `None` for NULL or a missing column.
    pub fn get(&self, idx: usize) -> Option<&str> {
        self.values.get(idx).and_then(|v| v.as_deref())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

struct Message {
    tag: BackendTag,
    body: Vec<u8>,
}

/// A synchronous PostgreSQL connection.
pub struct PgConnection {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    write_buf: Vec<u8>,
    tx_status: TransactionStatus,
    process_id: i32,
    server_params: Vec<(String, String)>,
    broken: bool,
}

impl PgConnection {
    /// Connect to `endpoint` and complete authentication.
    ///
    /// `timeout` bounds the TCP connect and every later socket read or write.
    pub fn connect(endpoint: &Endpoint, timeout: Duration) -> PgResult<Self> {
        let addr = (endpoint.host.as_str(), endpoint.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| PgError::Protocol(format!("cannot resolve {}", endpoint.address())))?;
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;

        let mut conn = Self {
            reader: BufReader::with_capacity(16 * 1024, stream.try_clone()?),
            writer: stream,
            write_buf: Vec::with_capacity(1024),
            tx_status: TransactionStatus::Idle,
            process_id: 0,
            server_params: Vec::new(),
            broken: false,
        };
        conn.startup(endpoint)?;
        debug!(endpoint = %endpoint, pid = conn.process_id, "connected");
        Ok(conn)
    }

    fn startup(&mut self, endpoint: &Endpoint) -> PgResult<()> {
        self.write_buf.clear();
        codec::encode_startup(
            &mut self.write_buf,
            &endpoint.user,
            &endpoint.database,
            &[("application_name", "partita"), ("client_encoding", "UTF8")],
        );
        self.flush()?;

        loop {
            let msg = self.read_message()?;
            match msg.tag {
                BackendTag::AuthenticationRequest => self.authenticate(endpoint, &msg.body)?,
                BackendTag::ParameterStatus => {
                    let (name, consumed) = codec::read_cstring(&msg.body, 0)?;
                    let (value, _) = codec::read_cstring(&msg.body, consumed)?;
                    self.server_params.push((name.to_string(), value.to_string()));
                }
                BackendTag::BackendKeyData => {
                    self.process_id = codec::read_i32(&msg.body, 0)?;
                }
                BackendTag::ReadyForQuery => {
                    self.set_status(&msg.body);
                    return Ok(());
                }
                BackendTag::ErrorResponse => {
                    self.broken = true;
                    return Err(codec::parse_error(&msg.body));
                }
                _ => {}
            }
        }
    }

    fn authenticate(&mut self, endpoint: &Endpoint, body: &[u8]) -> PgResult<()> {
        let code = codec::read_i32(body, 0)?;
        match AuthType::from_i32(code) {
            Some(AuthType::Ok) => Ok(()),
            Some(AuthType::CleartextPassword) => {
                self.write_buf.clear();
                codec::encode_password(&mut self.write_buf, &endpoint.password);
                self.flush()
            }
            Some(AuthType::SASLInit) => {
                let mechanisms = codec::parse_sasl_mechanisms(body)?;
                if !mechanisms.iter().any(|m| m == SCRAM_SHA_256) {
                    return Err(PgError::Auth(format!(
                        "server offers no supported SASL mechanism: {:?}",
                        mechanisms
                    )));
                }
                self.scram_exchange(endpoint)
            }
            Some(AuthType::MD5Password) => Err(PgError::Auth(
                "MD5 authentication is not supported, use SCRAM-SHA-256".to_string(),
            )),
            _ => Err(PgError::Auth(format!("unsupported auth type: {}", code))),
        }
    }

    fn scram_exchange(&mut self, endpoint: &Endpoint) -> PgResult<()> {
        let mut scram = ScramClient::new(&endpoint.user, &endpoint.password);
        let client_first = scram.client_first_message();
        self.write_buf.clear();
        codec::encode_sasl_initial(&mut self.write_buf, SCRAM_SHA_256, &client_first);
        self.flush()?;

        let server_first = self.expect_auth(AuthType::SASLContinue)?;
        let client_final = scram.process_server_first(&server_first)?;
        self.write_buf.clear();
        codec::encode_sasl_response(&mut self.write_buf, &client_final);
        self.flush()?;

        let server_final = self.expect_auth(AuthType::SASLFinal)?;
        scram.verify_server_final(&server_final)?;
        trace!("SCRAM exchange complete");
        Ok(())
    }

    /// Read the next AuthenticationRequest, require `expected`, and return
    /// the SASL payload after the Int32 auth type.
    fn expect_auth(&mut self, expected: AuthType) -> PgResult<Vec<u8>> {
        let msg = self.read_message()?;
        match msg.tag {
            BackendTag::AuthenticationRequest => {
                let code = codec::read_i32(&msg.body, 0)?;
                if AuthType::from_i32(code) != Some(expected) {
                    return Err(PgError::Auth(format!(
                        "expected {:?} during SASL, got auth type {}",
                        expected, code
                    )));
                }
                Ok(msg.body[4..].to_vec())
            }
            BackendTag::ErrorResponse => Err(codec::parse_error(&msg.body)),
            other => Err(PgError::Protocol(format!(
                "unexpected {:?} during SASL",
                other
            ))),
        }
    }

    // ─── Query Methods ────────────────────────────────────────

    /// Run one or more statements without parameters, discarding rows.
    pub fn simple_query(&mut self, sql: &str) -> PgResult<()> {
        self.ensure_usable()?;
        self.write_buf.clear();
        codec::encode_query(&mut self.write_buf, sql);
        let outcome = self.flush().and_then(|_| self.read_until_ready());
        self.track(outcome).map(|_| ())
    }

    /// Run a parameterized statement and return its rows.
    pub fn query(&mut self, sql: &str, params: &[Option<&str>]) -> PgResult<Vec<Row>> {
        self.extended(sql, params).map(|(rows, _)| rows)
    }

    /// Run a parameterized statement and return the affected row count.
    pub fn execute(&mut self, sql: &str, params: &[Option<&str>]) -> PgResult<u64> {
        self.extended(sql, params).map(|(_, affected)| affected)
    }

    fn extended(&mut self, sql: &str, params: &[Option<&str>]) -> PgResult<(Vec<Row>, u64)> {
        self.ensure_usable()?;
        self.write_buf.clear();
        codec::encode_parse(&mut self.write_buf, sql);
        codec::encode_bind(&mut self.write_buf, params);
        codec::encode_execute(&mut self.write_buf);
        codec::encode_sync(&mut self.write_buf);
        let outcome = self.flush().and_then(|_| self.read_until_ready());
        self.track(outcome)
    }

    pub fn transaction_status(&self) -> TransactionStatus {
        self.tx_status
    }

    pub fn server_param(&self, name: &str) -> Option<&str> {
        self.server_params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    // ─── Internal Methods ─────────────────────────────────────

    fn ensure_usable(&self) -> PgResult<()> {
        if self.broken {
            Err(PgError::ConnectionClosed)
        } else {
            Ok(())
        }
    }

    fn track<T>(&mut self, outcome: PgResult<T>) -> PgResult<T> {
        if let Err(err) = &outcome {
            if err.is_connection_loss() {
                self.broken = true;
            }
        }
        outcome
    }

    fn flush(&mut self) -> PgResult<()> {
        self.writer.write_all(&self.write_buf)?;
        Ok(())
    }

    fn read_message(&mut self) -> PgResult<Message> {
        let mut header = [0u8; 5];
        if let Err(err) = self.reader.read_exact(&mut header) {
            return Err(if err.kind() == std::io::ErrorKind::UnexpectedEof {
                PgError::ConnectionClosed
            } else {
                PgError::Io(err)
            });
        }
        let mut body = vec![0u8; codec::body_len(&header)?];
        self.reader.read_exact(&mut body)?;
        Ok(Message {
            tag: BackendTag::from(header[0]),
            body,
        })
    }

    /// Collect rows and the affected count until ReadyForQuery. A server
    /// error is held until then so the connection stays in sync.
    fn read_until_ready(&mut self) -> PgResult<(Vec<Row>, u64)> {
        let mut rows = Vec::new();
        let mut affected = 0;
        let mut error = None;
        loop {
            let msg = self.read_message()?;
            match msg.tag {
                BackendTag::DataRow => rows.push(Row::new(codec::parse_data_row(&msg.body)?)),
                BackendTag::CommandComplete => affected = codec::parse_command_tag(&msg.body)?,
                BackendTag::ErrorResponse => error = Some(codec::parse_error(&msg.body)),
                BackendTag::ReadyForQuery => {
                    self.set_status(&msg.body);
                    return match error {
                        Some(err) => Err(err),
                        None => Ok((rows, affected)),
                    };
                }
                _ => {}
            }
        }
    }

    fn set_status(&mut self, body: &[u8]) {
        self.tx_status = body
            .first()
            .copied()
            .map(TransactionStatus::from)
            .unwrap_or(TransactionStatus::Idle);
    }
}

impl Drop for PgConnection {
    fn drop(&mut self) {
        if self.broken {
            return;
        }
        self.write_buf.clear();
        codec::encode_terminate(&mut self.write_buf);
        let _ = self.writer.write_all(&self.write_buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_accessors() {
        let row = Row::new(vec![Some("1".to_string()), None]);
        assert_eq!(row.get(0), Some("1"));
        assert_eq!(row.get(1), None);
        assert_eq!(row.get(2), None);
        assert_eq!(row.len(), 2);
    }
}
