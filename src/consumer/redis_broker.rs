//! Redis Streams implementation of [`StreamBroker`]

use crate::consumer::broker::{
    BrokerFactory, ReadGroupRequest, StreamBroker, StreamMessage, NEW_ENTRIES_ID,
};
use crate::consumer::config::ConsumerConfig;
use crate::consumer::error::{BrokerError, ConsumerError, ConsumerResult};
use async_trait::async_trait;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

/// Reconnect attempts the connection manager makes per dropped connection
/// before surfacing the error to the caller.
const RECONNECT_RETRIES: usize = 1;

/// Opens self-healing Redis connections with fixed connect/response timeouts
#[derive(Debug, Clone)]
pub struct RedisBrokerFactory {
    client: redis::Client,
    address: String,
    connect_timeout: Duration,
    response_timeout: Duration,
}

impl RedisBrokerFactory {
    /// Create a factory from the consumer configuration
    pub fn new(config: &ConsumerConfig) -> ConsumerResult<Self> {
        let client = redis::Client::open(config.redis_url()).map_err(|e| {
            ConsumerError::ConfigError(format!("Invalid Redis address: {}", e))
        })?;

        Ok(Self {
            client,
            address: format!("{}:{}", config.host, config.port),
            connect_timeout: config.connect_timeout,
            response_timeout: config.response_timeout,
        })
    }

    fn manager_config(&self) -> ConnectionManagerConfig {
        ConnectionManagerConfig::new()
            .set_connection_timeout(self.connect_timeout)
            .set_response_timeout(self.response_timeout)
            .set_number_of_retries(RECONNECT_RETRIES)
    }
}

#[async_trait]
impl BrokerFactory for RedisBrokerFactory {
    type Broker = RedisBroker;

    /// The returned connection re-dials on its own after the socket drops.
    async fn open(&self) -> Result<RedisBroker, BrokerError> {
        let conn = ConnectionManager::new_with_config(self.client.clone(), self.manager_config())
            .await?;
        Ok(RedisBroker { conn })
    }

    fn describe(&self) -> String {
        self.address.clone()
    }
}

/// One Redis connection used by a single consumer loop
pub struct RedisBroker {
    conn: ConnectionManager,
}

#[async_trait]
impl StreamBroker for RedisBroker {
    async fn ping(&mut self) -> Result<(), BrokerError> {
        let pong: String = redis::cmd("PING").query_async(&mut self.conn).await?;
        if pong != "PONG" {
            return Err(BrokerError::Response(format!("PING answered {:?}", pong)));
        }
        Ok(())
    }

    async fn create_group(
        &mut self,
        stream: &str,
        group: &str,
        start_id: &str,
    ) -> Result<(), BrokerError> {
        let _: () = self
            .conn
            .xgroup_create_mkstream(stream, group, start_id)
            .await?;
        Ok(())
    }

    async fn read_group(
        &mut self,
        request: &ReadGroupRequest,
    ) -> Result<Vec<StreamMessage>, BrokerError> {
        let options = StreamReadOptions::default()
            .group(&request.group, &request.consumer)
            .count(request.count)
            .block(request.block.as_millis() as usize);

        // A BLOCK that times out answers nil rather than an empty reply.
        let reply: Option<StreamReadReply> = self
            .conn
            .xread_options(&[request.stream.as_str()], &[NEW_ENTRIES_ID], &options)
            .await?;

        let Some(reply) = reply else {
            return Ok(Vec::new());
        };

        let mut messages = Vec::new();
        for key in reply.keys {
            for entry in key.ids {
                let mut fields = BTreeMap::new();
                for (name, value) in entry.map {
                    match redis::from_redis_value::<String>(&value) {
                        Ok(text) => {
                            fields.insert(name, text);
                        }
                        Err(e) => {
                            // Leave it out; the handler's presence check decides.
                            warn!(
                                message_id = %entry.id,
                                field = %name,
                                error = %e,
                                "Dropping non-string field value"
                            );
                        }
                    }
                }
                messages.push(StreamMessage::new(key.key.clone(), entry.id, fields));
            }
        }

        debug!(count = messages.len(), stream = %request.stream, "Fetched entries");
        Ok(messages)
    }

    async fn ack(&mut self, stream: &str, group: &str, id: &str) -> Result<u64, BrokerError> {
        let acked: u64 = self.conn.xack(stream, group, &[id]).await?;
        Ok(acked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{TcpListener, TcpStream};

    /// Reply for one command; `None` closes the socket without answering.
    type Responder = dyn Fn(&[String]) -> Option<Vec<u8>> + Send + Sync;

    /// Loopback RESP2 server driven by a responder closure.
    struct StubRedis {
        addr: SocketAddr,
        commands: Arc<Mutex<Vec<Vec<String>>>>,
        connections: Arc<AtomicUsize>,
    }

    impl StubRedis {
        async fn start(responder: Arc<Responder>) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap();
            let commands = Arc::new(Mutex::new(Vec::new()));
            let connections = Arc::new(AtomicUsize::new(0));

            let log = commands.clone();
            let accepted = connections.clone();
            tokio::spawn(async move {
                while let Ok((socket, _)) = listener.accept().await {
                    accepted.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve(socket, responder.clone(), log.clone()));
                }
            });

            Self {
                addr,
                commands,
                connections,
            }
        }

        fn factory(&self) -> RedisBrokerFactory {
            let config = ConsumerConfig::builder()
                .host("127.0.0.1")
                .port(self.addr.port())
                .response_timeout(Duration::from_secs(2))
                .build();
            RedisBrokerFactory::new(&config).unwrap()
        }

        fn last(&self, name: &str) -> Vec<String> {
            self.commands
                .lock()
                .iter()
                .rev()
                .find(|cmd| cmd.first().is_some_and(|c| c.eq_ignore_ascii_case(name)))
                .cloned()
                .unwrap_or_default()
        }
    }

    async fn serve(
        socket: TcpStream,
        responder: Arc<Responder>,
        log: Arc<Mutex<Vec<Vec<String>>>>,
    ) {
        let (read, mut write) = socket.into_split();
        let mut reader = BufReader::new(read);
        while let Some(command) = read_command(&mut reader).await {
            log.lock().push(command.clone());
            match responder(&command) {
                Some(reply) => {
                    if write.write_all(&reply).await.is_err() {
                        return;
                    }
                }
                None => return,
            }
        }
    }

    async fn read_command(
        reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
    ) -> Option<Vec<String>> {
        let mut line = String::new();
        if reader.read_line(&mut line).await.ok()? == 0 {
            return None;
        }
        let count: usize = line.trim_end().strip_prefix('*')?.parse().ok()?;

        let mut args = Vec::with_capacity(count);
        for _ in 0..count {
            line.clear();
            reader.read_line(&mut line).await.ok()?;
            let len: usize = line.trim_end().strip_prefix('$')?.parse().ok()?;
            let mut buf = vec![0; len + 2];
            reader.read_exact(&mut buf).await.ok()?;
            buf.truncate(len);
            args.push(String::from_utf8(buf).ok()?);
        }
        Some(args)
    }

    fn bulk(s: &str) -> String {
        format!("${}\r\n{}\r\n", s.len(), s)
    }

    /// Handshake and housekeeping commands every connection sends.
    fn default_reply(command: &[String]) -> Vec<u8> {
        match command[0].to_ascii_uppercase().as_str() {
            "PING" => b"+PONG\r\n".to_vec(),
            _ => b"+OK\r\n".to_vec(),
        }
    }

    fn arg_after<'a>(command: &'a [String], flag: &str) -> Option<&'a str> {
        let pos = command.iter().position(|a| a.eq_ignore_ascii_case(flag))?;
        command.get(pos + 1).map(String::as_str)
    }

    fn request(block: Duration) -> ReadGroupRequest {
        ReadGroupRequest {
            stream: "message_stream".into(),
            group: "processors".into(),
            consumer: "consumer-1a2b3c4d".into(),
            count: 10,
            block,
        }
    }

    #[tokio::test]
    async fn test_blocking_read_timeout_is_empty_batch() {
        let stub = StubRedis::start(Arc::new(|cmd: &[String]| {
            Some(match cmd[0].to_ascii_uppercase().as_str() {
                "XREADGROUP" => b"*-1\r\n".to_vec(),
                _ => default_reply(cmd),
            })
        }))
        .await;
        let mut broker = stub.factory().open().await.unwrap();

        let batch = broker
            .read_group(&request(Duration::from_millis(100)))
            .await
            .unwrap();

        assert!(batch.is_empty());
        let sent = stub.last("XREADGROUP");
        assert_eq!(arg_after(&sent, "GROUP"), Some("processors"));
        assert_eq!(arg_after(&sent, "processors"), Some("consumer-1a2b3c4d"));
        assert_eq!(arg_after(&sent, "COUNT"), Some("10"));
        assert_eq!(arg_after(&sent, "BLOCK"), Some("100"));
        assert_eq!(sent[sent.len() - 3..], ["STREAMS", "message_stream", ">"]);
    }

    #[tokio::test]
    async fn test_read_decodes_entry_and_skips_non_string_values() {
        let entry = format!(
            "*1\r\n*2\r\n{}*1\r\n*2\r\n{}*6\r\n{}{}{}{}{}$-1\r\n",
            bulk("message_stream"),
            bulk("1718000000000-0"),
            bulk("content"),
            bulk("hello"),
            bulk("sender"),
            bulk("alice"),
            bulk("timestamp"),
        );
        let stub = StubRedis::start(Arc::new(move |cmd: &[String]| {
            Some(match cmd[0].to_ascii_uppercase().as_str() {
                "XREADGROUP" => entry.clone().into_bytes(),
                _ => default_reply(cmd),
            })
        }))
        .await;
        let mut broker = stub.factory().open().await.unwrap();

        let batch = broker
            .read_group(&request(Duration::from_millis(100)))
            .await
            .unwrap();

        assert_eq!(batch.len(), 1);
        let message = &batch[0];
        assert_eq!(message.id, "1718000000000-0");
        assert_eq!(message.stream, "message_stream");
        assert_eq!(message.field("content"), Some("hello"));
        assert_eq!(message.field("sender"), Some("alice"));
        assert_eq!(message.field("timestamp"), None);
    }

    #[tokio::test]
    async fn test_ack_and_busygroup_replies() {
        let stub = StubRedis::start(Arc::new(|cmd: &[String]| {
            Some(match cmd[0].to_ascii_uppercase().as_str() {
                "XACK" => b":1\r\n".to_vec(),
                "XGROUP" => b"-BUSYGROUP Consumer Group name already exists\r\n".to_vec(),
                _ => default_reply(cmd),
            })
        }))
        .await;
        let mut broker = stub.factory().open().await.unwrap();

        let acked = broker
            .ack("message_stream", "processors", "1-0")
            .await
            .unwrap();
        assert_eq!(acked, 1);
        assert_eq!(
            stub.last("XACK"),
            ["XACK", "message_stream", "processors", "1-0"]
        );

        let err = broker
            .create_group("message_stream", "processors", "0")
            .await
            .unwrap_err();
        assert!(matches!(err, BrokerError::GroupAlreadyExists(_)), "{err:?}");
        assert_eq!(arg_after(&stub.last("XGROUP"), "processors"), Some("0"));
        assert!(stub.last("XGROUP").iter().any(|a| a == "MKSTREAM"));
    }

    #[tokio::test]
    async fn test_reconnects_after_dropped_socket() {
        let acks = Arc::new(AtomicUsize::new(0));
        let seen = acks.clone();
        // The first XACK kills its connection without a reply; later ones succeed.
        let stub = StubRedis::start(Arc::new(move |cmd: &[String]| {
            if cmd[0].eq_ignore_ascii_case("XACK") {
                if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                    return None;
                }
                return Some(b":1\r\n".to_vec());
            }
            Some(default_reply(cmd))
        }))
        .await;
        let mut broker = stub.factory().open().await.unwrap();
        broker.ping().await.unwrap();

        let dropped = broker.ack("message_stream", "processors", "1-0").await;
        assert!(dropped.is_err());

        let mut recovered = None;
        for _ in 0..20 {
            if let Ok(acked) = broker.ack("message_stream", "processors", "1-0").await {
                recovered = Some(acked);
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        assert_eq!(recovered, Some(1), "connection was never re-established");
        assert!(stub.connections.load(Ordering::SeqCst) >= 2);
        broker.ping().await.unwrap();
    }
}
