//! Integration tests: a scripted HTTP/2 client byte stream driven through the
//! server engine, checking event sequences and the frames written back.

use helix_h2::frame::decode_frame;
use helix_h2::hpack::{Decoder, Encoder};
use helix_h2::{CLIENT_PREFACE, ErrorCode, Frame, H2Connection, H2Event, HeaderField, Settings};

fn encode(frames: &[Frame]) -> Vec<u8> {
    let mut buf = Vec::new();
    for frame in frames {
        frame.encode(&mut buf);
    }
    buf
}

fn decode_all(mut buf: &[u8]) -> Vec<Frame> {
    let mut out = Vec::new();
    while let Some((frame, n)) = decode_frame(buf, 16_777_215).unwrap() {
        out.push(frame);
        buf = &buf[n..];
    }
    out
}

/// A client session: preface, SETTINGS, a GET, a POST with a body split over
/// two DATA frames, a PING and a SETTINGS ACK.
fn client_session() -> Vec<u8> {
    let mut enc = Encoder::new();
    let get = enc.encode(&[
        HeaderField::new(":method", "GET"),
        HeaderField::new(":scheme", "https"),
        HeaderField::new(":path", "/index"),
        HeaderField::new(":authority", "localhost"),
    ]);
    let post = enc.encode(&[
        HeaderField::new(":method", "POST"),
        HeaderField::new(":scheme", "https"),
        HeaderField::new(":path", "/submit"),
        HeaderField::new(":authority", "localhost"),
        HeaderField::new("content-type", "text/plain"),
    ]);
    let (post_a, post_b) = post.split_at(post.len() / 2);

    let mut buf = CLIENT_PREFACE.to_vec();
    buf.extend(encode(&[
        Frame::Settings {
            ack: false,
            params: vec![(0x4, 1 << 20)],
        },
        Frame::Headers {
            stream_id: 1,
            encoded: get,
            end_stream: true,
            end_headers: true,
            priority: None,
        },
        Frame::Headers {
            stream_id: 3,
            encoded: post_a.to_vec(),
            end_stream: false,
            end_headers: false,
            priority: None,
        },
        Frame::Continuation {
            stream_id: 3,
            encoded: post_b.to_vec(),
            end_headers: true,
        },
        Frame::Data {
            stream_id: 3,
            payload: b"hello ".to_vec(),
            end_stream: false,
        },
        Frame::Ping {
            ack: false,
            opaque_data: *b"pingpong",
        },
        Frame::Data {
            stream_id: 3,
            payload: b"world".to_vec(),
            end_stream: true,
        },
        Frame::Settings {
            ack: true,
            params: vec![],
        },
    ]));
    buf
}

/// Feed `input` in chunks of `chunk` bytes; return every event and every
/// byte written back.
fn run_chunked(input: &[u8], chunk: usize) -> (Vec<H2Event>, Vec<u8>) {
    let mut conn = H2Connection::server(Settings::server_default());
    let mut events = Vec::new();
    let mut output = conn.take_pending_send();
    for piece in input.chunks(chunk) {
        conn.recv(piece).unwrap();
        events.extend(std::iter::from_fn(|| conn.poll_event()));
        output.extend(conn.take_pending_send());
    }
    (events, output)
}

#[test]
fn any_chunking_yields_same_events() {
    let input = client_session();
    let (reference_events, reference_output) = run_chunked(&input, input.len());
    assert!(!reference_events.is_empty());

    for chunk in [1, 2, 3, 5, 7, 9, 13, 24, 25, 64, 100] {
        let (events, output) = run_chunked(&input, chunk);
        assert_eq!(events, reference_events, "chunk size {chunk}");
        assert_eq!(output, reference_output, "chunk size {chunk}");
    }
}

#[test]
fn session_event_sequence() {
    let input = client_session();
    let (events, output) = run_chunked(&input, input.len());

    assert_eq!(events[0], H2Event::StreamOpened { stream_id: 1 });
    assert!(matches!(
        events[1],
        H2Event::Headers {
            stream_id: 1,
            end_stream: true,
            ..
        }
    ));
    assert_eq!(events[2], H2Event::HalfClosed { stream_id: 1 });
    assert_eq!(events[3], H2Event::StreamOpened { stream_id: 3 });
    match &events[4] {
        H2Event::Headers {
            stream_id: 3,
            headers,
            end_stream: false,
        } => assert_eq!(headers[4], HeaderField::new("content-type", "text/plain")),
        other => panic!("expected POST headers, got {other:?}"),
    }
    let body: Vec<u8> = events
        .iter()
        .filter_map(|e| match e {
            H2Event::Data { data, .. } => Some(data.clone()),
            _ => None,
        })
        .flatten()
        .collect();
    assert_eq!(body, b"hello world");
    assert_eq!(events[events.len() - 2], H2Event::HalfClosed { stream_id: 3 });
    assert_eq!(events[events.len() - 1], H2Event::SettingsAcknowledged);

    let frames = decode_all(&output);
    assert!(matches!(frames[0], Frame::Settings { ack: false, .. }));
    assert!(frames.contains(&Frame::Settings {
        ack: true,
        params: vec![]
    }));
    assert!(frames.contains(&Frame::Ping {
        ack: true,
        opaque_data: *b"pingpong",
    }));
}

#[test]
fn response_exchange_decodes_on_client_side() {
    let input = client_session();
    let mut conn = H2Connection::server(Settings::server_default());
    conn.recv(&input).unwrap();
    conn.take_pending_send();

    let mut finished = Vec::new();
    while let Some(event) = conn.poll_event() {
        if let H2Event::HalfClosed { stream_id } = event {
            finished.push(stream_id);
        }
    }
    assert_eq!(finished, vec![1, 3]);

    conn.send_headers(
        1,
        &[
            HeaderField::new(":status", "200"),
            HeaderField::new("content-length", "9"),
        ],
        false,
    )
    .unwrap();
    conn.send_data(1, b"TEST DATA", true).unwrap();
    conn.send_headers(3, &[HeaderField::new(":status", "204")], true)
        .unwrap();
    assert_eq!(conn.stream_count(), 0);

    let mut client_decoder = Decoder::new();
    let frames = decode_all(&conn.take_pending_send());
    assert_eq!(frames.len(), 3);

    match &frames[0] {
        Frame::Headers {
            stream_id: 1,
            encoded,
            end_stream: false,
            end_headers: true,
            ..
        } => {
            let headers = client_decoder.decode(encoded).unwrap();
            assert_eq!(headers[0], HeaderField::new(":status", "200"));
        }
        other => panic!("expected HEADERS, got {other:?}"),
    }
    assert_eq!(
        frames[1],
        Frame::Data {
            stream_id: 1,
            payload: b"TEST DATA".to_vec(),
            end_stream: true,
        }
    );
    match &frames[2] {
        Frame::Headers {
            stream_id: 3,
            encoded,
            end_stream: true,
            ..
        } => {
            let headers = client_decoder.decode(encoded).unwrap();
            assert_eq!(headers, vec![HeaderField::new(":status", "204")]);
        }
        other => panic!("expected HEADERS, got {other:?}"),
    }
}

#[test]
fn corrupt_header_block_is_compression_error() {
    let mut conn = H2Connection::server(Settings::server_default());
    conn.take_pending_send();
    let mut input = CLIENT_PREFACE.to_vec();
    input.extend(encode(&[
        Frame::Settings {
            ack: false,
            params: vec![],
        },
        Frame::Headers {
            stream_id: 1,
            encoded: vec![0xfe],
            end_stream: true,
            end_headers: true,
            priority: None,
        },
    ]));
    let err = conn.recv(&input).unwrap_err();
    assert_eq!(err.code(), ErrorCode::CompressionError);

    let frames = decode_all(&conn.take_pending_send());
    match frames.last() {
        Some(Frame::GoAway { error_code, .. }) => {
            assert_eq!(*error_code, ErrorCode::CompressionError)
        }
        other => panic!("expected GOAWAY, got {other:?}"),
    }
}
