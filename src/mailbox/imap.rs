//! IMAP over TLS, using the synchronous `imap` client.

use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use native_tls::{TlsConnector, TlsStream};
use tracing::{debug, info};

use crate::config::MailboxConfig;
use crate::error::{RegistryError, Result};

use super::{MailboxConnector, MailboxSession, MessageId};

/// Connects to an IMAPS server with username/password login.
#[derive(Clone)]
pub struct ImapConnector {
    host: String,
    port: u16,
    username: String,
    password: String,
    timeout: Duration,
}

/// Socket timeout when none is configured.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

impl std::fmt::Debug for ImapConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImapConnector")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl ImapConnector {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            password: password.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Bound the TCP connect and every socket read and write.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Build from configuration, rejecting incomplete settings.
    pub fn from_config(cfg: &MailboxConfig) -> Result<Self> {
        cfg.validate()?;
        Ok(Self::new(
            cfg.host.clone(),
            cfg.port,
            cfg.username.clone(),
            cfg.password.clone(),
        )
        .with_timeout(cfg.timeout()))
    }

    /// Open a TCP connection with the connect, read and write timeouts set.
    fn open_socket(&self) -> Result<TcpStream> {
        let connect_error = |e: std::io::Error| {
            RegistryError::Connectivity(format!("{}:{}: {e}", self.host, self.port))
        };

        let addrs = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(connect_error)?;

        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(stream) => {
                    stream
                        .set_read_timeout(Some(self.timeout))
                        .and_then(|()| stream.set_write_timeout(Some(self.timeout)))
                        .map_err(connect_error)?;
                    return Ok(stream);
                }
                Err(e) => {
                    debug!(%addr, error = %e, "Connect attempt failed");
                    last_err = Some(e);
                }
            }
        }
        Err(match last_err {
            Some(e) => connect_error(e),
            None => RegistryError::Connectivity(format!(
                "{}:{}: host resolved to no addresses",
                self.host, self.port
            )),
        })
    }
}

impl MailboxConnector for ImapConnector {
    fn connect(&self) -> Result<Box<dyn MailboxSession>> {
        let tls = TlsConnector::builder()
            .build()
            .map_err(|e| RegistryError::Connectivity(format!("TLS setup failed: {e}")))?;

        let socket = self.open_socket()?;
        let stream = tls.connect(&self.host, socket).map_err(|e| {
            RegistryError::Connectivity(format!(
                "{}:{}: TLS handshake failed: {e}",
                self.host, self.port
            ))
        })?;

        let mut client = ::imap::Client::new(stream);
        client.read_greeting().map_err(|e| classify(e, None))?;

        let session = client
            .login(&self.username, &self.password)
            .map_err(|(e, _client)| match e {
                ::imap::Error::No(msg) | ::imap::Error::Bad(msg) => RegistryError::Auth(msg),
                other => classify(other, None),
            })?;

        info!(host = %self.host, user = %self.username, "Connected to mailbox");
        Ok(Box::new(ImapSession {
            session,
            closed: false,
        }))
    }
}

/// An authenticated IMAP session.
pub struct ImapSession {
    session: ::imap::Session<TlsStream<TcpStream>>,
    closed: bool,
}

impl MailboxSession for ImapSession {
    fn list_unread(&mut self, folder: &str) -> Result<Vec<MessageId>> {
        let mailbox = self
            .session
            .select(folder)
            .map_err(|e| classify(e, None))?;
        debug!(folder, exists = mailbox.exists, "Selected folder");

        let uids = self
            .session
            .uid_search("UNSEEN")
            .map_err(|e| classify(e, None))?;

        let mut ids: Vec<MessageId> = uids.into_iter().map(MessageId).collect();
        ids.sort_unstable();
        Ok(ids)
    }

    fn fetch(&mut self, id: MessageId) -> Result<Vec<u8>> {
        // BODY.PEEK leaves \Seen untouched
        let fetches = self
            .session
            .uid_fetch(id.to_string(), "BODY.PEEK[]")
            .map_err(|e| classify(e, Some(id)))?;

        let body = fetches
            .iter()
            .find_map(|f| f.body())
            .ok_or_else(|| RegistryError::fetch(id.to_string(), "server returned no body"))?;
        Ok(body.to_vec())
    }

    fn mark_read(&mut self, id: MessageId) -> Result<()> {
        self.session
            .uid_store(id.to_string(), "+FLAGS (\\Seen)")
            .map_err(|e| classify(e, Some(id)))?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.session
            .logout()
            .map_err(|e| RegistryError::Connectivity(format!("LOGOUT failed: {e}")))
    }
}

/// Map a client error onto the registry's fatal / per-message split.
///
/// Server refusals and unparseable responses concern one command; transport
/// failures mean the session is gone.
fn classify(err: ::imap::Error, id: Option<MessageId>) -> RegistryError {
    use ::imap::Error as E;
    match err {
        E::No(msg) | E::Bad(msg) => match id {
            Some(id) => RegistryError::fetch(id.to_string(), msg),
            None => RegistryError::Connectivity(format!("server refused command: {msg}")),
        },
        E::Parse(e) => match id {
            Some(id) => RegistryError::fetch(id.to_string(), format!("unparseable response: {e}")),
            None => RegistryError::Connectivity(format!("unparseable response: {e}")),
        },
        E::Io(e) => RegistryError::Connectivity(e.to_string()),
        E::ConnectionLost => RegistryError::Connectivity("connection lost".into()),
        other => RegistryError::Connectivity(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refusal_for_message_is_not_fatal() {
        let err = classify(::imap::Error::No("no such message".into()), Some(MessageId(5)));
        assert!(matches!(err, RegistryError::Fetch { ref id, .. } if id == "5"));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_transport_errors_are_fatal() {
        assert!(classify(::imap::Error::ConnectionLost, Some(MessageId(1))).is_fatal());
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        assert!(classify(::imap::Error::Io(io), None).is_fatal());
    }

    #[test]
    fn test_refused_select_is_fatal() {
        assert!(classify(::imap::Error::Bad("unknown folder".into()), None).is_fatal());
    }

    #[test]
    fn test_debug_hides_password() {
        let c = ImapConnector::new("imap.example.com", 993, "clerk", "s3cret");
        assert!(!format!("{c:?}").contains("s3cret"));
    }

    #[test]
    fn test_silent_server_times_out() {
        // Accepts the TCP connection (backlog) but never answers the handshake
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let connector = ImapConnector::new("127.0.0.1", port, "clerk", "secret")
            .with_timeout(Duration::from_millis(200));

        let started = std::time::Instant::now();
        let err = connector.connect().err().expect("connect should fail");
        assert!(matches!(err, RegistryError::Connectivity(_)), "{err:?}");
        assert!(started.elapsed() < Duration::from_secs(5));
        drop(listener);
    }

    #[test]
    fn test_closed_port_is_connectivity_error() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let connector = ImapConnector::new("127.0.0.1", port, "clerk", "secret")
            .with_timeout(Duration::from_millis(200));
        assert!(matches!(
            connector.open_socket(),
            Err(RegistryError::Connectivity(_))
        ));
    }

    #[test]
    fn test_from_config_requires_credentials() {
        let cfg = MailboxConfig::default();
        assert!(matches!(
            ImapConnector::from_config(&cfg),
            Err(RegistryError::Config(_))
        ));
    }
}
