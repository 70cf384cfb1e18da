fn main() {
    println!("Run `cargo test -p wire-compat` to execute wire compatibility tests.");
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use network_monitor_protocol::{Command, Frame, FrameDecoder};
    use serde::Deserialize;

    /// Frames in the shape a given broker sends them, and what they decode to.
    #[derive(Debug, Deserialize)]
    struct Fixture {
        broker: String,
        /// Re-encoding the frames reproduces `raw` exactly.
        #[serde(default)]
        canonical: bool,
        raw: String,
        frames: Vec<ExpectedFrame>,
    }

    #[derive(Debug, Deserialize)]
    struct ExpectedFrame {
        command: String,
        headers: Vec<(String, String)>,
        body: String,
    }

    /// Returns the path to the fixtures directory.
    fn fixtures_dir() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures")
    }

    fn load_fixture(name: &str) -> Fixture {
        let path = fixtures_dir().join(name);
        let data = fs::read_to_string(&path)
            .unwrap_or_else(|e| panic!("failed to read fixture {}: {e}", path.display()));
        serde_json::from_str(&data)
            .unwrap_or_else(|e| panic!("failed to parse fixture {}: {e}", path.display()))
    }

    fn decode_all(bytes: &[u8], chunk: usize) -> Vec<Frame> {
        let mut decoder = FrameDecoder::default();
        let mut frames = Vec::new();
        for piece in bytes.chunks(chunk.max(1)) {
            decoder.extend(piece);
            while let Some(frame) = decoder.next_frame().expect("decode failed") {
                frames.push(frame);
            }
        }
        assert_eq!(decoder.buffered(), 0, "trailing bytes left undecoded");
        frames
    }

    fn assert_matches(name: &str, fixture: &Fixture, frames: &[Frame]) {
        assert_eq!(
            frames.len(),
            fixture.frames.len(),
            "{name} ({}): frame count",
            fixture.broker
        );
        for (i, (got, want)) in frames.iter().zip(&fixture.frames).enumerate() {
            assert_eq!(got.command.to_string(), want.command, "{name}[{i}]: command");
            let headers: Vec<(String, String)> = got
                .headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            assert_eq!(headers, want.headers, "{name}[{i}]: headers");
            assert_eq!(
                String::from_utf8_lossy(&got.body),
                want.body,
                "{name}[{i}]: body"
            );
        }
    }

    /// Decodes the fixture whole, then byte by byte, and checks both
    /// against the expected frames. Canonical fixtures must also re-encode
    /// to the fixture bytes.
    fn wire_test(name: &str) {
        let fixture = load_fixture(name);
        let raw = fixture.raw.as_bytes();

        let whole = decode_all(raw, raw.len());
        assert_matches(name, &fixture, &whole);

        let split = decode_all(raw, 1);
        assert_eq!(whole, split, "{name}: chunking changed the result");

        if fixture.canonical {
            let encoded: Vec<u8> = whole.iter().flat_map(|f| f.encode().to_vec()).collect();
            assert_eq!(
                String::from_utf8_lossy(&encoded),
                fixture.raw,
                "{name}: re-encoding mismatch"
            );
        }
    }

    #[test]
    fn fixture_rabbitmq_connected() {
        wire_test("rabbitmq_connected.json");
    }

    #[test]
    fn fixture_artemis_connected_with_crlf() {
        wire_test("artemis_connected.json");
    }

    #[test]
    fn fixture_spring_message() {
        wire_test("spring_message.json");
    }

    #[test]
    fn fixture_rabbitmq_escaped_headers() {
        wire_test("rabbitmq_message_escaped.json");
    }

    #[test]
    fn fixture_error_frame() {
        wire_test("error_frame.json");
    }

    #[test]
    fn fixture_heartbeats_between_frames() {
        wire_test("heartbeats_between_frames.json");
    }

    #[test]
    fn spring_message_body_is_json() {
        let fixture = load_fixture("spring_message.json");
        let frames = decode_all(fixture.raw.as_bytes(), 7);
        let frame = &frames[0];
        assert_eq!(frame.command, Command::Message);
        assert!(frame.is_json());
        let payload: serde_json::Value = frame.parse_json().unwrap();
        assert_eq!(payload, serde_json::json!({"id": "A", "status": "ok"}));
    }

    #[test]
    fn all_fixtures_are_covered() {
        let mut names: Vec<String> = fs::read_dir(fixtures_dir())
            .expect("fixtures directory")
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.ends_with(".json"))
            .collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                "artemis_connected.json",
                "error_frame.json",
                "heartbeats_between_frames.json",
                "rabbitmq_connected.json",
                "rabbitmq_message_escaped.json",
                "spring_message.json",
            ]
        );
    }
}
