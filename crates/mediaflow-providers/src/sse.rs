use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum SseFrame {
    Data(Value),
    Done,
}

/// Removes every complete frame (terminated by a blank line) from `buffer`
/// and decodes its `data:` payloads. A trailing partial frame, including a
/// multi-byte character cut by a chunk boundary, stays in the buffer for the
/// next chunk. Undecodable payloads are skipped.
pub fn drain_sse_frames(buffer: &mut Vec<u8>) -> Vec<SseFrame> {
    if buffer.contains(&b'\r') {
        buffer.retain(|b| *b != b'\r');
    }
    let mut out = Vec::new();
    while let Some(pos) = find_frame_end(buffer) {
        let frame: Vec<u8> = buffer.drain(..pos + 2).take(pos).collect();
        let frame = match String::from_utf8(frame) {
            Ok(frame) => frame,
            Err(err) => {
                tracing::debug!("skipping stream frame with invalid utf-8: {}", err);
                continue;
            }
        };
        for line in frame.lines() {
            let line = line.trim();
            let Some(payload) = line.strip_prefix("data:") else {
                continue;
            };
            let payload = payload.trim();
            if payload == "[DONE]" {
                out.push(SseFrame::Done);
                continue;
            }
            match serde_json::from_str::<Value>(payload) {
                Ok(value) => out.push(SseFrame::Data(value)),
                Err(err) => tracing::debug!("skipping undecodable stream frame: {}", err),
            }
        }
    }
    out
}

fn find_frame_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(2).position(|w| w == b"\n\n")
}
