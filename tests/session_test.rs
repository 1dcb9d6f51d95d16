mod common;

use common::{FakeIngest, Script, init_logging, is_video, reassemble, wait_for_event};
use ftl_ingest::{FtlError, IngestParams, IngestSession, SessionState, TransportConfig};
use ftlcore::rtcp::{NackEntry, NackFeedback};
use ftlcore::rtp::RtpHeader;
use ftlcore::status::{EventKind, EventReason};
use std::time::Duration;

const STREAM_KEY: &str = "42-secret";
const SPS: [u8; 8] = [0x67, 0x42, 0xc0, 0x1f, 0xda, 0x01, 0x40, 0x16];
const IDR: [u8; 6] = [0x65, 0x88, 0x84, 0x00, 0x33, 0xff];

fn config_for(ingest: &FakeIngest) -> TransportConfig {
    TransportConfig {
        control_port: ingest.control_port,
        recv_timeout_ms: 1000,
        watchdog_poll_ms: 20,
        ..Default::default()
    }
}

fn session_for(config: TransportConfig) -> IngestSession {
    IngestSession::with_config(IngestParams::new("127.0.0.1", STREAM_KEY), config).unwrap()
}

#[tokio::test]
async fn test_handshake_announces_stream() {
    init_logging();
    let mut ingest = FakeIngest::start(Script::accepting("secret")).await;
    let session = session_for(config_for(&ingest));

    session.connect().await.unwrap();
    assert_eq!(session.state(), SessionState::Connected);
    assert_eq!(session.media_port(), Some(ingest.media_port()));
    wait_for_event(&session, EventKind::Connected).await;

    let commands = ingest.drain_commands();
    assert_eq!(commands[0], "HMAC");
    assert!(commands[1].starts_with("CONNECT 42 $"));
    assert!(commands.iter().any(|c| c == "ProtocolVersion: 0.9"));
    assert!(commands.iter().any(|c| c == "VideoIngestSSRC: 43"));
    assert!(commands.iter().any(|c| c == "AudioIngestSSRC: 42"));
    assert!(commands.iter().any(|c| c == "."));

    assert_eq!(session.connect().await, Err(FtlError::AlreadyConnected));

    session.disconnect().await.unwrap();
    assert_eq!(session.state(), SessionState::Idle);
    let event = wait_for_event(&session, EventKind::Disconnected).await;
    assert_eq!(event.reason, EventReason::ApiRequest);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(ingest.drain_commands().iter().any(|c| c == "DISCONNECT"));

    // A second disconnect is a no-op.
    session.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_rejected_stream_key() {
    init_logging();
    let mut ingest = FakeIngest::start(Script {
        connect_code: 405,
        ..Script::accepting("secret")
    })
    .await;
    let session = session_for(config_for(&ingest));

    assert_eq!(session.connect().await, Err(FtlError::BadOrInvalidStreamKey));
    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(session.media_port(), None);

    let commands = ingest.wait_for_eof().await;
    assert_eq!(commands.len(), 2);
    assert!(commands[1].starts_with("CONNECT 42 $"));
}

#[tokio::test]
async fn test_rejected_challenge_request() {
    init_logging();
    let mut ingest = FakeIngest::start(Script {
        hmac_code: 500,
        ..Script::accepting("secret")
    })
    .await;
    let session = session_for(config_for(&ingest));

    assert_eq!(session.connect().await, Err(FtlError::IngestNoResponse));
    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(ingest.wait_for_eof().await, vec!["HMAC".to_string()]);
}

#[tokio::test]
async fn test_rejected_metadata_block() {
    init_logging();
    let mut ingest = FakeIngest::start(Script {
        dot_code: 406,
        ..Script::accepting("secret")
    })
    .await;
    let session = session_for(config_for(&ingest));

    assert_eq!(session.connect().await, Err(FtlError::ChannelInUse));
    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(session.media_port(), None);

    let commands = ingest.wait_for_eof().await;
    assert_eq!(commands.last().map(String::as_str), Some("."));
    assert!(commands.iter().any(|c| c == "AudioIngestSSRC: 42"));

    // Nothing was left half open; a later attempt starts from scratch.
    assert_eq!(session.connect().await, Err(FtlError::ChannelInUse));
    assert_eq!(ingest.wait_for_eof().await[0], "HMAC");
}

#[tokio::test]
async fn test_wrong_secret_is_unauthorized() {
    init_logging();
    let mut ingest = FakeIngest::start(Script::accepting("another-secret")).await;
    let session = session_for(config_for(&ingest));

    assert_eq!(session.connect().await, Err(FtlError::Unauthorized));
    assert_eq!(session.state(), SessionState::Idle);
    assert_eq!(ingest.wait_for_eof().await.len(), 2);
}

#[tokio::test]
async fn test_nack_triggers_single_resend() {
    init_logging();
    let ingest = FakeIngest::start(Script::accepting("secret")).await;
    let session = session_for(config_for(&ingest));
    session.connect().await.unwrap();

    // Video is held back until audio has been offered once.
    assert_eq!(session.send_video(0, &SPS, false), 0);
    session.send_audio(0, &[0xfc, 0xff, 0xfe]);
    assert_eq!(session.send_video(0, &SPS, false), 12 + SPS.len());
    assert_eq!(session.send_video(0, &IDR, true), 12 + IDR.len());
    assert!(session.send_audio(20_000, &[0xfc, 0xff, 0xfe]) > 0);

    let (first, client) = ingest.recv_media(is_video).await;
    let (header, offset) = RtpHeader::decode(&first).unwrap();
    assert_eq!(header.ssrc, 43);
    assert_eq!(header.sequence_number, 0);
    assert!(!header.marker);
    assert_eq!(&first[offset..], &SPS);

    let (second, _) = ingest.recv_media(is_video).await;
    let (header, offset) = RtpHeader::decode(&second).unwrap();
    assert_eq!(header.sequence_number, 1);
    assert!(header.marker);
    assert_eq!(&second[offset..], &IDR);

    let nack = NackFeedback {
        sender_ssrc: 0,
        media_ssrc: 43,
        entries: vec![NackEntry::single(0)],
    };
    ingest.media.send_to(&nack.encode(), client).await.unwrap();

    let (resent, _) = ingest.recv_media(is_video).await;
    assert_eq!(resent, first);

    // Nothing else arrives for that sequence number.
    let mut buf = [0u8; 2048];
    let deadline = tokio::time::Instant::now() + Duration::from_millis(300);
    while let Ok(Ok((len, _))) =
        tokio::time::timeout_at(deadline, ingest.media.recv_from(&mut buf)).await
    {
        if is_video(&buf[..len]) {
            panic!("unexpected video packet after the resend");
        }
    }

    let stats = session.video_stats().unwrap();
    assert_eq!(stats.nack_requests, 1);

    session.destroy().await.unwrap();
}

#[tokio::test]
async fn test_steady_stream_and_repeated_nack() {
    init_logging();
    let ingest = FakeIngest::start(Script::accepting("secret")).await;
    let session = session_for(config_for(&ingest));
    session.connect().await.unwrap();

    let audio = [0xfc, 0xff, 0xfe, 0x01];
    let p_frame = [0x41, 0x9a, 0x02, 0x11, 0x80];
    session.send_audio(0, &audio);

    for frame in 0..50i64 {
        let dts = frame * 33_333;
        if frame == 0 {
            assert!(session.send_video(dts, &SPS, false) > 0);
            assert!(session.send_video(dts, &IDR, true) > 0);
        } else {
            assert!(session.send_video(dts, &p_frame, true) > 0);
        }
        assert!(session.send_audio(frame * 20_000, &audio) > 0);
    }

    // SPS + IDR + 49 P frames.
    let mut packets = Vec::new();
    while packets.len() < 51 {
        let (packet, client) = ingest.recv_media(is_video).await;
        packets.push((packet, client));
    }
    let sequences: Vec<u16> = packets
        .iter()
        .map(|(packet, _)| RtpHeader::decode(packet).unwrap().0.sequence_number)
        .collect();
    assert_eq!(sequences, (0..51).collect::<Vec<u16>>());

    tokio::time::sleep(Duration::from_millis(50)).await;
    let stats = session.video_stats().unwrap();
    assert_eq!(stats.frames_dropped, 0);
    assert_eq!(stats.frames_sent, 50);

    let (original, client) = &packets[25];
    let nack = NackFeedback {
        sender_ssrc: 0,
        media_ssrc: 43,
        entries: vec![NackEntry::single(25)],
    };
    for _ in 0..2 {
        ingest.media.send_to(&nack.encode(), *client).await.unwrap();
        let (resent, _) = ingest.recv_media(is_video).await;
        assert_eq!(&resent, original);
    }
    assert_eq!(session.video_stats().unwrap().nack_requests, 2);

    session.destroy().await.unwrap();
}

#[tokio::test]
async fn test_fragmented_keyframe_and_partial_nack() {
    init_logging();
    let ingest = FakeIngest::start(Script::accepting("secret")).await;
    let session = session_for(config_for(&ingest));
    session.connect().await.unwrap();

    let mut idr = vec![0x65u8];
    idr.extend((1..5_000).map(|i| (i % 241) as u8));

    session.send_audio(0, &[0xfc, 0xff, 0xfe]);
    assert!(session.send_video(0, &SPS, false) > 0);
    assert!(session.send_video(0, &idr, true) > idr.len());

    // 4999 bytes after the NAL header, 1378 per FU-A fragment.
    let mut packets = Vec::new();
    let mut client = None;
    while packets.len() < 5 {
        let (packet, from) = ingest.recv_media(is_video).await;
        client = Some(from);
        packets.push(packet);
    }
    let client = client.unwrap();
    assert!(packets.iter().all(|p| p.len() <= 1392));
    assert_eq!(reassemble(&packets), vec![SPS.to_vec(), idr.clone()]);

    let nack = NackFeedback {
        sender_ssrc: 0,
        media_ssrc: 43,
        entries: vec![NackEntry::from_sequences(&[2, 4]).unwrap()],
    };
    ingest.media.send_to(&nack.encode(), client).await.unwrap();

    let mut resent = Vec::new();
    for _ in 0..2 {
        let (packet, _) = ingest.recv_media(is_video).await;
        resent.push(packet);
    }
    resent.sort_by_key(|p| RtpHeader::decode(p).unwrap().0.sequence_number);
    assert_eq!(resent, vec![packets[2].clone(), packets[4].clone()]);
    assert_eq!(session.video_stats().unwrap().nack_requests, 2);

    session.destroy().await.unwrap();
}

#[tokio::test]
async fn test_ingest_error_code_drops_session() {
    init_logging();
    let ingest = FakeIngest::start(Script {
        unsolicited: Some("408\n".to_string()),
        ..Script::accepting("secret")
    })
    .await;
    let session = session_for(config_for(&ingest));
    session.connect().await.unwrap();

    let event = wait_for_event(&session, EventKind::Disconnected).await;
    assert_eq!(event.reason, EventReason::NoMedia);
    assert_eq!(event.error, Some(FtlError::NoMediaTimeout));
    assert_eq!(session.state(), SessionState::Idle);

    // The session can be brought back up.
    session.connect().await.unwrap();
    session.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_silent_ingest_times_out() {
    init_logging();
    let ingest = FakeIngest::start(Script {
        answer_pings: false,
        ..Script::accepting("secret")
    })
    .await;
    let config = TransportConfig {
        keepalive_interval_ms: 50,
        no_ping_timeout_ms: 200,
        ..config_for(&ingest)
    };
    let session = session_for(config);
    session.connect().await.unwrap();

    let event = wait_for_event(&session, EventKind::Disconnected).await;
    assert_eq!(event.reason, EventReason::Unknown);
    assert_eq!(event.error, Some(FtlError::NoPingResponse));
    assert_eq!(session.state(), SessionState::Idle);
}
