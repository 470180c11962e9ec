//! Minimal in-process broker for session tests.
//!
//! Speaks just enough MQTT 3.1.1 to accept a client: it reads raw packets
//! and answers CONNECT with an accepted CONNACK.

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
};

/// CONNACK, session not present, return code 0.
const CONNACK_ACCEPTED: [u8; 4] = [0x20, 0x02, 0x00, 0x00];

/// Accepts one client, acknowledges its CONNECT and returns the open socket.
/// Dropping the socket looks like a broker crash to the client.
pub async fn accept_session(listener: &TcpListener) -> TcpStream {
    let (mut socket, _) = listener.accept().await.unwrap();
    let (header, _) = read_packet(&mut socket).await;
    assert_eq!(header >> 4, 1, "expected CONNECT");
    socket.write_all(&CONNACK_ACCEPTED).await.unwrap();
    socket
}

/// Reads one packet. Returns the first header byte and the variable part.
pub async fn read_packet(socket: &mut TcpStream) -> (u8, Vec<u8>) {
    let header = socket.read_u8().await.unwrap();

    let mut len = 0usize;
    let mut shift = 0;
    loop {
        let byte = socket.read_u8().await.unwrap();
        len |= usize::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }

    let mut body = vec![0; len];
    socket.read_exact(&mut body).await.unwrap();
    (header, body)
}

/// Topic and payload of a QoS 0 PUBLISH body.
pub fn publish_topic_and_payload(body: &[u8]) -> (String, String) {
    let topic_len = usize::from(u16::from_be_bytes([body[0], body[1]]));
    let topic = String::from_utf8(body[2..2 + topic_len].to_vec()).unwrap();
    let payload = String::from_utf8(body[2 + topic_len..].to_vec()).unwrap();
    (topic, payload)
}
