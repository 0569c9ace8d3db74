use std::io::{ErrorKind, Read, Write};
use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;
use std::thread;
use std::time::{Duration, Instant};
use tapeserver::daemon::frame::{read_frame, write_frame, ProcessForkerFrame, MAX_PAYLOAD_LEN};
use tapeserver::daemon::protocol::MsgType;
use tapeserver::error::FrameError;

const TIMEOUT: Duration = Duration::from_secs(1);

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn test_frames_come_back_byte_for_byte() {
    let (a, b) = UnixStream::pair().unwrap();

    for msg_type in MsgType::ALL {
        for len in [1, 7, 512, MAX_PAYLOAD_LEN] {
            let sent = ProcessForkerFrame::new(msg_type, payload(len));
            write_frame(a.as_fd(), &sent).unwrap();

            let received = read_frame(b.as_fd(), TIMEOUT).unwrap();
            assert_eq!(received, sent, "type={} len={}", msg_type, len);
        }
    }
}

#[test]
fn test_unknown_type_tag_is_read_back() {
    let (a, b) = UnixStream::pair().unwrap();
    let sent = ProcessForkerFrame {
        msg_type: 999,
        payload: vec![42],
    };
    write_frame(a.as_fd(), &sent).unwrap();

    let received = read_frame(b.as_fd(), TIMEOUT).unwrap();
    assert_eq!(received.msg_type, 999);
    assert_eq!(received.type_name(), "UNKNOWN");
}

#[test]
fn test_oversize_header_rejected_before_payload_read() {
    let (mut a, b) = UnixStream::pair().unwrap();
    a.write_all(&MsgType::Exception.as_u32().to_ne_bytes()).unwrap();
    a.write_all(&((MAX_PAYLOAD_LEN + 1) as u32).to_ne_bytes()).unwrap();
    a.write_all(&[0xab]).unwrap();

    let err = read_frame(b.as_fd(), TIMEOUT).unwrap_err();
    assert!(matches!(
        err,
        FrameError::PayloadTooLarge {
            max: MAX_PAYLOAD_LEN,
            actual
        } if actual == MAX_PAYLOAD_LEN + 1
    ));

    // The first payload byte is still waiting in the socket
    let mut byte = [0u8; 1];
    (&b).read_exact(&mut byte).unwrap();
    assert_eq!(byte, [0xab]);
}

#[test]
fn test_empty_payload_writes_nothing() {
    let (a, b) = UnixStream::pair().unwrap();
    let frame = ProcessForkerFrame::new(MsgType::ReturnValue, Vec::new());

    let err = write_frame(a.as_fd(), &frame).unwrap_err();
    assert!(matches!(err, FrameError::EmptyPayload));

    b.set_nonblocking(true).unwrap();
    let mut buf = [0u8; 16];
    let err = (&b).read(&mut buf).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::WouldBlock);
}

#[test]
fn test_silent_peer_times_out() {
    let (_a, b) = UnixStream::pair().unwrap();

    let start = Instant::now();
    let err = read_frame(b.as_fd(), TIMEOUT).unwrap_err();
    let elapsed = start.elapsed();

    assert!(err.is_timeout(), "unexpected error: {}", err);
    assert!(!err.is_connection_closed());
    assert!(elapsed >= Duration::from_millis(900), "timed out after {:?}", elapsed);
    assert!(elapsed < Duration::from_secs(3), "timed out after {:?}", elapsed);
}

#[test]
fn test_half_header_then_close_is_short_read() {
    let (mut a, b) = UnixStream::pair().unwrap();
    a.write_all(&[1, 0]).unwrap();
    drop(a);

    let err = read_frame(b.as_fd(), TIMEOUT).unwrap_err();
    assert!(!err.is_timeout());
    assert!(matches!(
        err,
        FrameError::ShortRead {
            what: "payload type",
            expected: 4,
            actual: 2
        }
    ));
}

#[test]
fn test_slow_writer_within_timeout_is_fine() {
    let (mut a, b) = UnixStream::pair().unwrap();
    let writer = thread::spawn(move || {
        let frame = ProcessForkerFrame::new(MsgType::ForkSucceeded, payload(16));
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&frame.msg_type.to_ne_bytes());
        bytes.extend_from_slice(&(frame.payload.len() as u32).to_ne_bytes());
        bytes.extend_from_slice(&frame.payload);
        for chunk in bytes.chunks(5) {
            a.write_all(chunk).unwrap();
            thread::sleep(Duration::from_millis(20));
        }
        frame
    });

    let received = read_frame(b.as_fd(), TIMEOUT).unwrap();
    assert_eq!(received, writer.join().unwrap());
}
