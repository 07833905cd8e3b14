use std::sync::{Arc, RwLock};

use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, info};

use crate::config::Config;
use crate::crypto::KeySlot;
use crate::error::ProtoError;
use crate::packet_header::{Flags, Opcode, PacketHeader, Proto};
use crate::reliable::ReliableContext;
use crate::send_pipeline;
use crate::tcp;
use crate::udp;

/// Delivery sink for received packets: `(stream_id, opcode, payload)`.
/// Callers that need extra context capture it in the closure.
pub type RecvHandler = Arc<dyn Fn(u32, u8, &[u8]) + Send + Sync>;

/// A transport handle, tagged by kind so a proto/handle mismatch is a typed
/// error instead of undefined behavior.
pub enum Conn<'a> {
    Tcp(&'a mut TcpStream),
    Udp(&'a UdpSocket),
    ReliableUdp(&'a ReliableContext),
}

struct EndpointState {
    initialized: bool,
    config: Config,
    handler: Option<RecvHandler>,
}

/// The library facade: lifecycle, handler binding, the composed send path
/// and the receive-side delivery tail.
///
/// One read-write lock guards the init flag, config and handler (written by
/// `init`/`shutdown`/`set_handler`, read on the send fast path); the AEAD key
/// slot carries its own lock so crypto never contends with configuration.
pub struct OverProto {
    state: RwLock<EndpointState>,
    key: KeySlot,
}

impl Default for OverProto {
    fn default() -> OverProto {
        OverProto::new()
    }
}

impl OverProto {
    pub fn new() -> OverProto {
        OverProto {
            state: RwLock::new(EndpointState {
                initialized: false,
                config: Config::default(),
                handler: None,
            }),
            key: KeySlot::new(),
        }
    }

    /// Bring the endpoint up. Rejects a second call until `shutdown`.
    pub fn init(&self, config: Option<Config>) -> Result<(), ProtoError> {
        let mut state = self.state.write().expect("endpoint lock poisoned");
        if state.initialized {
            return Err(ProtoError::AlreadyInitialized);
        }

        let config = config.unwrap_or_default();
        config.validate()?;

        info!("initializing (tcp {}, udp {}, mtu {})", config.tcp_port, config.udp_port, config.mtu);
        state.config = config;
        state.initialized = true;
        Ok(())
    }

    /// Tear down: zeroize and release the AEAD key, unbind the handler, and
    /// flip the init flag. Safe to call when never initialized.
    pub fn shutdown(&self) {
        let mut state = self.state.write().expect("endpoint lock poisoned");
        if !state.initialized {
            return;
        }

        self.key.clear();
        state.handler = None;
        state.config = Config::default();
        state.initialized = false;
        info!("shut down");
    }

    pub fn is_initialized(&self) -> bool {
        self.state.read().expect("endpoint lock poisoned").initialized
    }

    pub fn config(&self) -> Config {
        self.state.read().expect("endpoint lock poisoned").config.clone()
    }

    pub fn set_handler(&self, handler: RecvHandler) {
        let mut state = self.state.write().expect("endpoint lock poisoned");
        state.handler = Some(handler);
    }

    pub fn set_encryption_key(&self, key: &[u8]) -> Result<(), ProtoError> {
        self.key.set(key)
    }

    pub fn is_encryption_enabled(&self) -> bool {
        self.key.is_enabled()
    }

    pub fn encryption(&self) -> &KeySlot {
        &self.key
    }

    /// The composed send path: reject oversize data, compress and encrypt per
    /// flags, stamp a header and dispatch to the transport matching `proto`.
    ///
    /// Returns the number of bytes written to the wire. RELIABLE UDP traffic
    /// must go through a [`Conn::ReliableUdp`] handle - a plain UDP socket
    /// cannot honor the flag.
    pub async fn send(
        &self,
        conn: Conn<'_>,
        stream_id: u32,
        opcode: Opcode,
        proto: Proto,
        data: &[u8],
        flags: Flags,
    ) -> Result<usize, ProtoError> {
        {
            let state = self.state.read().expect("endpoint lock poisoned");
            if !state.initialized {
                return Err(ProtoError::NotInitialized);
            }
        }

        let (payload, flags) = send_pipeline::prepare_payload(data, flags, &self.key)?;
        let header = PacketHeader::new(stream_id, opcode, proto, flags);

        match (proto, conn) {
            (Proto::Tcp, Conn::Tcp(stream)) => tcp::send(stream, &header, &payload).await,
            (Proto::Udp, Conn::Udp(socket)) => {
                if flags.contains(Flags::RELIABLE) {
                    debug!("RELIABLE flag on a plain udp handle");
                    return Err(ProtoError::BadConnType);
                }
                udp::send(socket, &header, &payload, None).await
            }
            (Proto::Udp, Conn::ReliableUdp(ctx)) => ctx.send(&header, &payload).await,
            (Proto::Http, _) => Err(ProtoError::UnsupportedProto(Proto::Http as u8)),
            _ => Err(ProtoError::BadConnType),
        }
    }

    /// The receive-side tail: undo encryption and compression per the header
    /// flags, then hand the payload to the bound handler.
    ///
    /// Transports produce `(header, payload)` pairs; fragmented and reliable
    /// handling happens upstream in the fragmenter and the reliable context.
    pub fn deliver(&self, header: &PacketHeader, payload: &[u8]) -> Result<(), ProtoError> {
        let handler = {
            let state = self.state.read().expect("endpoint lock poisoned");
            if !state.initialized {
                return Err(ProtoError::NotInitialized);
            }
            state.handler.clone()
        };

        let data = send_pipeline::open_payload(header.flags, payload, &self.key)?;

        if let Some(handler) = handler {
            handler(header.stream_id, header.opcode, &data);
        } else {
            debug!("no handler bound - dropping {} byte payload", data.len());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tokio::net::TcpListener;

    use crate::packet_header::MAX_PAYLOAD_SIZE;
    use crate::tcp::TcpConnection;

    use super::*;

    fn initialized() -> OverProto {
        let endpoint = OverProto::new();
        endpoint.init(None).unwrap();
        endpoint
    }

    #[test]
    fn test_init_rejects_second_call() {
        let endpoint = OverProto::new();
        assert!(endpoint.init(None).is_ok());
        assert!(matches!(endpoint.init(None), Err(ProtoError::AlreadyInitialized)));
    }

    #[test]
    fn test_init_validates_config() {
        let endpoint = OverProto::new();
        let config = Config { mtu: 10, ..Config::default() };
        assert!(matches!(endpoint.init(Some(config)), Err(ProtoError::MtuTooSmall(10))));
        assert!(!endpoint.is_initialized());
    }

    #[test]
    fn test_shutdown_clears_key_and_allows_reinit() {
        let endpoint = initialized();
        endpoint.set_encryption_key(&[7u8; 32]).unwrap();
        assert!(endpoint.is_encryption_enabled());

        endpoint.shutdown();
        assert!(!endpoint.is_initialized());
        assert!(!endpoint.is_encryption_enabled());

        assert!(endpoint.init(None).is_ok());
    }

    #[tokio::test]
    async fn test_send_requires_init() {
        let endpoint = OverProto::new();
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let result = endpoint
            .send(Conn::Udp(&socket), 1, Opcode::Data, Proto::Udp, b"x", Flags::empty())
            .await;
        assert!(matches!(result, Err(ProtoError::NotInitialized)));
    }

    #[tokio::test]
    async fn test_send_rejects_oversize_payload() {
        let endpoint = initialized();
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let data = vec![0u8; MAX_PAYLOAD_SIZE + 1];

        let result = endpoint
            .send(Conn::Udp(&socket), 1, Opcode::Data, Proto::Udp, &data, Flags::empty())
            .await;
        assert!(matches!(result, Err(ProtoError::PayloadTooLarge(_))));
    }

    #[tokio::test]
    async fn test_send_rejects_conn_mismatch() {
        let endpoint = initialized();
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let result = endpoint
            .send(Conn::Udp(&socket), 1, Opcode::Data, Proto::Tcp, b"x", Flags::empty())
            .await;
        assert!(matches!(result, Err(ProtoError::BadConnType)));
    }

    #[tokio::test]
    async fn test_send_rejects_reliable_flag_on_plain_udp() {
        let endpoint = initialized();
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let result = endpoint
            .send(Conn::Udp(&socket), 1, Opcode::Data, Proto::Udp, b"x", Flags::RELIABLE)
            .await;
        assert!(matches!(result, Err(ProtoError::BadConnType)));
    }

    #[tokio::test]
    async fn test_send_rejects_http_proto() {
        let endpoint = initialized();
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let result = endpoint
            .send(Conn::Udp(&socket), 1, Opcode::Data, Proto::Http, b"x", Flags::empty())
            .await;
        assert!(matches!(result, Err(ProtoError::UnsupportedProto(3))));
    }

    #[tokio::test]
    async fn test_tcp_send_recv_deliver() {
        let endpoint = initialized();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap().0 });
        let mut client = TcpStream::connect(addr).await.unwrap();
        let server = accept.await.unwrap();

        let n = endpoint
            .send(Conn::Tcp(&mut client), 9, Opcode::Data, Proto::Tcp, b"over tcp", Flags::empty())
            .await
            .unwrap();
        assert_eq!(n, 24 + 8 + 4);

        let conn = TcpConnection::new(server);
        let (header, payload) = conn.recv().await.unwrap();
        assert_eq!(header.stream_id, 9);

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        endpoint.set_handler(Arc::new(move |stream_id, opcode, data| {
            sink.lock().unwrap().push((stream_id, opcode, data.to_vec()));
        }));

        endpoint.deliver(&header, &payload).unwrap();
        let received = received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0], (9, Opcode::Data as u8, b"over tcp".to_vec()));
    }

    #[tokio::test]
    async fn test_udp_encrypted_round_trip() {
        let endpoint = initialized();
        endpoint.set_encryption_key(&[0u8; 32]).unwrap();

        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let receiver_addr = receiver.local_addr().unwrap();
        let sender = udp::connect("127.0.0.1", receiver_addr.port()).await.unwrap();

        let n = endpoint
            .send(Conn::Udp(&sender), 2, Opcode::Data, Proto::Udp, b"hi", Flags::ENCRYPTED)
            .await
            .unwrap();
        // payload grows to iv(12) | ciphertext(2) | tag(16)
        assert_eq!(n, 24 + 30 + 4);

        let (header, payload, _) = udp::recv(&receiver).await.unwrap();
        assert!(header.flags.contains(Flags::ENCRYPTED));
        assert_eq!(header.payload_len, 30);

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        endpoint.set_handler(Arc::new(move |_, _, data| {
            sink.lock().unwrap().push(data.to_vec());
        }));

        endpoint.deliver(&header, &payload).unwrap();
        assert_eq!(*received.lock().unwrap(), vec![b"hi".to_vec()]);
    }

    #[tokio::test]
    async fn test_send_sets_compression_flag_on_wire() {
        let endpoint = initialized();

        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let receiver_addr = receiver.local_addr().unwrap();
        let sender = udp::connect("127.0.0.1", receiver_addr.port()).await.unwrap();

        let data = vec![b'a'; 512];
        endpoint
            .send(Conn::Udp(&sender), 1, Opcode::Data, Proto::Udp, &data, Flags::empty())
            .await
            .unwrap();

        let (header, payload, _) = udp::recv(&receiver).await.unwrap();
        assert!(header.flags.contains(Flags::COMPRESSED));
        assert!(payload.len() < data.len());

        // and below the threshold the flag stays clear
        let small = vec![b'a'; 511];
        endpoint
            .send(Conn::Udp(&sender), 1, Opcode::Data, Proto::Udp, &small, Flags::empty())
            .await
            .unwrap();
        let (header, payload, _) = udp::recv(&receiver).await.unwrap();
        assert!(!header.flags.contains(Flags::COMPRESSED));
        assert_eq!(payload.len(), 511);
    }

    #[tokio::test]
    async fn test_deliver_without_handler_is_ok() {
        let endpoint = initialized();
        let mut header = PacketHeader::new(1, Opcode::Data, Proto::Udp, Flags::empty());
        header.payload_len = 2;
        assert!(endpoint.deliver(&header, b"ok").is_ok());
    }
}
