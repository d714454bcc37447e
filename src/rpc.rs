/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The supervisor's two RPC surfaces and the frame codec they share.
//!
//! Messages are length-prefixed JSON: a 4-byte big-endian length followed by
//! the payload. The external Unix socket (`socket` in the supervisor
//! directory) speaks [`SupervisorRequest`]/[`SupervisorResponse`], with the
//! `Supervisor` interface as its bootstrap. The inherited socket pair (fd 3
//! inside the sandbox) carries [`SupervisorMessage`]/[`AppMessage`]: the app
//! side's bootstrap is its `UiView`, and the supervisor side's is a
//! `SandstormApi` whose operations are all unimplemented for now.

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;

/// Name of the external RPC socket inside the supervisor directory.
pub const SOCKET_NAME: &str = "socket";

/// Readiness line written to stdout once the external socket is listening.
pub const READY_MESSAGE: &str = "Listening...\n";

/// Written to stdout instead when another supervisor already serves the
/// grain.
pub const ALREADY_RUNNING_MESSAGE: &str = "Already running...\n";

const LENGTH_PREFIX_SIZE: usize = 4;

/// Caps a single frame. Nothing the supervisor speaks comes near this.
const MAX_FRAME_SIZE: u32 = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_SIZE} byte limit")]
    TooLarge(u32),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("invalid frame payload: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Operations on the `Supervisor` bootstrap capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SupervisorRequest {
    /// Fetch the app's main `UiView`.
    GetMainView,
    /// Reset the idle watchdog.
    KeepAlive,
    /// Kill the app and exit.
    Shutdown,
    GetGrainSize,
    #[serde(rename_all = "camelCase")]
    GetGrainSizeWhenDifferent {
        old_size: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SupervisorResponse {
    MainView { view: UiView },
    Ok,
    Size { bytes: u64 },
    Error { message: String },
}

/// Opaque descriptor for the app's user-facing view capability. The
/// supervisor re-exports it verbatim; only the app and its clients interpret
/// the contents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiView(pub serde_json::Value);

/// Frames the supervisor sends to the app over the socket pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SupervisorMessage {
    /// Ask for the app's bootstrap view. Sent exactly once, at startup.
    GetMainView,
    /// Reply to a `SandstormApi` call.
    #[serde(rename_all = "camelCase")]
    ApiResult { id: u64, error: String },
}

/// Frames the app sends to the supervisor over the socket pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AppMessage {
    /// The app's bootstrap view, answering `GetMainView`.
    MainView { view: UiView },
    /// A call on the supervisor-side `SandstormApi` bootstrap.
    #[serde(rename_all = "camelCase")]
    ApiCall {
        id: u64,
        method: String,
        #[serde(default)]
        params: serde_json::Value,
    },
}

fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>, FrameError> {
    let payload = serde_json::to_vec(message)?;
    if payload.len() > MAX_FRAME_SIZE as usize {
        return Err(FrameError::TooLarge(payload.len() as u32));
    }
    let mut frame = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = encode(message)?;
    writer.write_all(&frame).await?;
    Ok(())
}

/// Read one frame. `Ok(None)` means the peer disconnected cleanly at a frame
/// boundary.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, FrameError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_bytes = [0u8; LENGTH_PREFIX_SIZE];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_bytes);
    if len > MAX_FRAME_SIZE {
        return Err(FrameError::TooLarge(len));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await?;
    Ok(Some(serde_json::from_slice(&payload)?))
}

/// Blocking variants, used by the single-instance probe before any event
/// loop exists.
pub mod blocking {
    use std::io::Read;
    use std::io::Write;

    use super::*;

    pub fn write_frame<W: Write, T: Serialize>(
        writer: &mut W,
        message: &T,
    ) -> Result<(), FrameError> {
        let frame = encode(message)?;
        writer.write_all(&frame)?;
        Ok(())
    }

    pub fn read_frame<R: Read, T: DeserializeOwned>(reader: &mut R) -> Result<T, FrameError> {
        let mut len_bytes = [0u8; LENGTH_PREFIX_SIZE];
        reader.read_exact(&mut len_bytes)?;
        let len = u32::from_be_bytes(len_bytes);
        if len > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(len));
        }
        let mut payload = vec![0u8; len as usize];
        reader.read_exact(&mut payload)?;
        Ok(serde_json::from_slice(&payload)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrip_blocking() {
        let mut buf = Vec::new();
        blocking::write_frame(
            &mut buf,
            &SupervisorRequest::GetGrainSizeWhenDifferent { old_size: 42 },
        )
        .unwrap();
        let decoded: SupervisorRequest = blocking::read_frame(&mut buf.as_slice()).unwrap();
        assert_eq!(
            decoded,
            SupervisorRequest::GetGrainSizeWhenDifferent { old_size: 42 }
        );
    }

    #[test]
    fn length_prefix_is_big_endian() {
        let mut buf = Vec::new();
        blocking::write_frame(&mut buf, &SupervisorRequest::KeepAlive).unwrap();
        let payload_len = (buf.len() - LENGTH_PREFIX_SIZE) as u32;
        assert_eq!(&buf[..4], &payload_len.to_be_bytes()[..]);
        assert_eq!(&buf[4..], &br#""keepAlive""#[..]);
    }

    #[test]
    fn oversized_frames_are_rejected() {
        let huge = vec![0u8; MAX_FRAME_SIZE as usize + 1];
        let mut buf = Vec::new();
        assert!(matches!(
            blocking::write_frame(&mut buf, &huge),
            Err(FrameError::TooLarge(_))
        ));

        let mut bogus = Vec::new();
        bogus.extend_from_slice(&(MAX_FRAME_SIZE + 1).to_be_bytes());
        assert!(matches!(
            blocking::read_frame::<_, SupervisorRequest>(&mut bogus.as_slice()),
            Err(FrameError::TooLarge(_))
        ));
    }

    #[tokio::test]
    async fn frame_roundtrip_async() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        write_frame(
            &mut a,
            &SupervisorResponse::MainView {
                view: UiView(serde_json::json!({"session": "root"})),
            },
        )
        .await
        .unwrap();
        let decoded: Option<SupervisorResponse> = read_frame(&mut b).await.unwrap();
        assert_eq!(
            decoded,
            Some(SupervisorResponse::MainView {
                view: UiView(serde_json::json!({"session": "root"})),
            })
        );
    }

    #[tokio::test]
    async fn clean_eof_reads_as_none() {
        let (a, mut b) = tokio::io::duplex(1024);
        drop(a);
        let decoded: Option<SupervisorRequest> = read_frame(&mut b).await.unwrap();
        assert!(decoded.is_none());
    }

    #[test]
    fn api_calls_tolerate_missing_params() {
        let msg: AppMessage =
            serde_json::from_str(r#"{"apiCall":{"id":1,"method":"publish"}}"#).unwrap();
        assert_eq!(
            msg,
            AppMessage::ApiCall {
                id: 1,
                method: "publish".to_string(),
                params: serde_json::Value::Null,
            }
        );
    }
}
