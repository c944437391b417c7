//! Loopback demonstration of the reliable messaging stack: two UDP
//! transports on localhost, an encrypted application frame from node 1
//! to node 2 and the standalone acknowledgement flowing back.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;

use matms::{messages, reliable, session, timer, transport};

#[derive(Parser, Debug)]
struct Cli {
    #[clap(long)]
    #[arg(default_value_t = false)]
    verbose: bool,
}

/// Configures logging based on verbosity level
fn setup_logging(verbose: bool) {
    let log_level = if verbose {
        log::LevelFilter::Trace
    } else {
        log::LevelFilter::Error
    };

    env_logger::Builder::new()
        .parse_default_env()
        .target(env_logger::Target::Stdout)
        .filter_level(log_level)
        .format_line_number(true)
        .format_file(true)
        .format_timestamp(Some(env_logger::TimestampPrecision::Millis))
        .init();
}

const NODE_A: u64 = 1;
const NODE_B: u64 = 2;
const EXCHANGE: u16 = 1;
const KEY_A_TO_B: [u8; 16] = *b"0123456789abcdef";

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let a = transport::Transport::new("127.0.0.1:0").await?;
    let b = transport::Transport::new("127.0.0.1:0").await?;
    a.register_peer(NODE_B, b.local_addr()?);
    b.register_peer(NODE_A, a.local_addr()?);
    let from_a = b.create_connection(a.local_addr()?).await;
    let from_b = a.create_connection(b.local_addr()?).await;

    // Session established out of band: node 2 allocates the receive
    // session id, node 1 encrypts towards it.
    let mut table_b = session::SecureSessionTable::new();
    let sess_b = table_b.create_session(session::SessionType::Case)?;
    let b_session_id = sess_b.local_session_id();
    sess_b.activate(NODE_B, NODE_A, 0);
    sess_b.set_decrypt_key(&KEY_A_TO_B);

    let mut table_a = session::SecureSessionTable::new();
    let sess_a = table_a.create_session(session::SessionType::Case)?;
    let a_session_id = sess_a.local_session_id();
    sess_a.activate(NODE_A, NODE_B, b_session_id);
    sess_a.set_encrypt_key(&KEY_A_TO_B);

    let (timers, _fired) = timer::TimerService::new();
    let clock: Arc<dyn timer::Clock> = Arc::new(timer::SystemClock);
    let sender_a: Arc<dyn transport::MessageSender> = a.clone();
    let mut mgr_a = reliable::ReliableMessageMgr::new(clock.clone(), sender_a, timers);
    mgr_a.alloc_context(EXCHANGE, NODE_B)?;

    let (timers_b, _fired_b) = timer::TimerService::new();
    let sender_b: Arc<dyn transport::MessageSender> = b.clone();
    let mut mgr_b = reliable::ReliableMessageMgr::new(clock, sender_b, timers_b);
    mgr_b.alloc_context(EXCHANGE, NODE_A)?;

    // node 1: encrypt an application frame demanding an ack and send it
    // reliably
    let mut plain = messages::ProtocolMessageHeader {
        exchange_flags: messages::ProtocolMessageHeader::FLAG_INITIATOR
            | messages::ProtocolMessageHeader::FLAG_RELIABILITY,
        opcode: 0x02,
        exchange_id: EXCHANGE,
        protocol_id: 1,
        ack_counter: 0,
    }
    .encode()?;
    plain.extend_from_slice(b"hello from node 1");
    let frame = table_a
        .get(a_session_id)
        .expect("session just created")
        .encode_message(&plain)?;
    mgr_a.send_reliable(EXCHANGE, &frame)?;

    // node 2: receive, decrypt, acknowledge
    let received = from_a.receive(Duration::from_secs(5)).await?;
    let (header, _) = messages::MessageHeader::decode(&received)?;
    let decrypted = table_b
        .get(header.session_id)
        .ok_or_else(|| anyhow::anyhow!("no session {}", header.session_id))?
        .decode_message(&received)?;
    let (proto, payload) = messages::ProtocolMessageHeader::decode(&decrypted)?;
    println!(
        "node 2 received on exchange {}: {}",
        proto.exchange_id,
        String::from_utf8_lossy(&payload)
    );
    mgr_b.handle_needs_ack(proto.exchange_id, header.message_counter, false)?;
    mgr_b.flush_acks(proto.exchange_id)?;

    // node 1: the ack clears the retransmission entry
    let ack_frame = from_b.receive(Duration::from_secs(5)).await?;
    let (ack, _) = messages::ProtocolMessageHeader::decode(&ack_frame)?;
    mgr_a.handle_rcvd_ack(ack.exchange_id, ack.ack_counter)?;
    println!(
        "node 1 got ack for counter {}, {} messages outstanding",
        ack.ack_counter,
        mgr_a.outstanding()
    );
    Ok(())
}
