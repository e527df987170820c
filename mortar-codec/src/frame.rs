//! Frame model and length-prefixed frame codec.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use mortar_core::{CodecError, MessageKind};

/// Default maximum frame size (16 MB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Conversation ID carried by control frames.
pub const CONTROL_CONVERSATION_ID: u64 = 0;

/// Conversation ID, kind, framelet count.
const FRAME_HEADER_LEN: usize = 8 + 1 + 2;

/// Framelet type, framelet length.
const FRAMELET_HEADER_LEN: usize = 2 + 4;

/// Type tag of a framelet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum FrameletType {
    /// Archived `LayerData`.
    LayerData = 1,
    /// Archived `Headers`.
    Headers = 2,
    /// Opaque application payload, or an archived `RpcError` in error frames.
    Payload = 3,
    /// Archived `ControlMessage`.
    Control = 4,
}

impl TryFrom<u16> for FrameletType {
    type Error = CodecError;

    fn try_from(value: u16) -> Result<Self, CodecError> {
        match value {
            1 => Ok(Self::LayerData),
            2 => Ok(Self::Headers),
            3 => Ok(Self::Payload),
            4 => Ok(Self::Control),
            other => Err(CodecError::InvalidFrame(format!(
                "unknown framelet type {other}"
            ))),
        }
    }
}

/// One length-delimited segment of a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Framelet {
    /// What the content holds.
    pub framelet_type: FrameletType,
    /// Raw framelet bytes.
    pub content: Bytes,
}

/// The unit of wire transmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Correlates a request with its response. Zero for control frames.
    pub conversation_id: u64,
    /// Message kind tag.
    pub kind: MessageKind,
    /// Framelets in wire order.
    pub framelets: Vec<Framelet>,
}

impl Frame {
    /// Create an empty frame.
    #[must_use]
    pub fn new(conversation_id: u64, kind: MessageKind) -> Self {
        Self {
            conversation_id,
            kind,
            framelets: Vec::with_capacity(3),
        }
    }

    /// Create a message frame with framelets in wire order.
    #[must_use]
    pub fn message(
        conversation_id: u64,
        kind: MessageKind,
        layer_data: Option<Bytes>,
        headers: Option<Bytes>,
        payload: Bytes,
    ) -> Self {
        let mut frame = Self::new(conversation_id, kind);
        if let Some(layer_data) = layer_data {
            frame = frame.with_framelet(FrameletType::LayerData, layer_data);
        }
        if let Some(headers) = headers {
            frame = frame.with_framelet(FrameletType::Headers, headers);
        }
        frame.with_framelet(FrameletType::Payload, payload)
    }

    /// Create a control frame.
    #[must_use]
    pub fn control(content: Bytes) -> Self {
        Self::new(CONTROL_CONVERSATION_ID, MessageKind::Control)
            .with_framelet(FrameletType::Control, content)
    }

    /// Append a framelet.
    #[must_use]
    pub fn with_framelet(mut self, framelet_type: FrameletType, content: Bytes) -> Self {
        self.framelets.push(Framelet {
            framelet_type,
            content,
        });
        self
    }

    /// Find the first framelet of a type.
    #[must_use]
    pub fn framelet(&self, framelet_type: FrameletType) -> Option<&Bytes> {
        self.framelets
            .iter()
            .find(|f| f.framelet_type == framelet_type)
            .map(|f| &f.content)
    }

    /// Layer data framelet, if present.
    #[must_use]
    pub fn layer_data(&self) -> Option<&Bytes> {
        self.framelet(FrameletType::LayerData)
    }

    /// Headers framelet, if present.
    #[must_use]
    pub fn headers(&self) -> Option<&Bytes> {
        self.framelet(FrameletType::Headers)
    }

    /// Payload framelet, if present.
    #[must_use]
    pub fn payload(&self) -> Option<&Bytes> {
        self.framelet(FrameletType::Payload)
    }

    /// Control framelet, if present.
    #[must_use]
    pub fn control_content(&self) -> Option<&Bytes> {
        self.framelet(FrameletType::Control)
    }

    /// Check the framelet sequence against the kind.
    ///
    /// Control frames hold exactly one control framelet. Every other kind
    /// holds optional layer data, then headers for requests and events,
    /// then the payload.
    pub fn validate(&self) -> Result<(), CodecError> {
        let types: Vec<FrameletType> = self.framelets.iter().map(|f| f.framelet_type).collect();

        let valid = if self.kind == MessageKind::Control {
            types == [FrameletType::Control]
        } else {
            let rest = match types.split_first() {
                Some((FrameletType::LayerData, rest)) => rest,
                _ => types.as_slice(),
            };
            if self.kind.carries_headers() {
                rest == [FrameletType::Headers, FrameletType::Payload]
            } else {
                rest == [FrameletType::Payload]
            }
        };

        if valid {
            Ok(())
        } else {
            Err(CodecError::InvalidFrame(format!(
                "unexpected framelet sequence {types:?} for {} frame",
                self.kind
            )))
        }
    }

    /// Size of the frame body, excluding the length prefix.
    #[must_use]
    pub fn body_len(&self) -> usize {
        FRAME_HEADER_LEN
            + self
                .framelets
                .iter()
                .map(|f| FRAMELET_HEADER_LEN + f.content.len())
                .sum::<usize>()
    }
}

/// Length-prefixed frame codec.
///
/// Decoding validates the framelet sequence, so every frame handed to the
/// connection is structurally sound. Framelet contents stay opaque.
///
/// ## Example
///
/// ```rust
/// use bytes::{Bytes, BytesMut};
/// use mortar_codec::{Frame, FrameCodec};
/// use mortar_core::MessageKind;
/// use tokio_util::codec::Decoder;
///
/// let mut codec = FrameCodec::new();
/// let mut buf = BytesMut::new();
///
/// let frame = Frame::message(1, MessageKind::Response, None, None, Bytes::from_static(b"hello"));
/// codec.encode_frame(&frame, &mut buf).unwrap();
///
/// let decoded = codec.decode(&mut buf).unwrap().unwrap();
/// assert_eq!(decoded, frame);
/// ```
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    /// Create a new codec with default settings.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Create a codec with a custom maximum frame size.
    #[inline]
    #[must_use]
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Get the maximum frame size.
    #[inline]
    #[must_use]
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Encode a frame into the buffer.
    pub fn encode_frame(&self, frame: &Frame, dst: &mut BytesMut) -> Result<(), CodecError> {
        frame.validate()?;

        let len = frame.body_len();
        if len > self.max_frame_size || u32::try_from(len).is_err() {
            return Err(CodecError::FrameTooLarge {
                size: len,
                max: self.max_frame_size,
            });
        }
        let framelet_count = u16::try_from(frame.framelets.len())
            .map_err(|_| CodecError::InvalidFrame("too many framelets".to_string()))?;

        dst.reserve(4 + len);
        dst.put_u32_le(len as u32);
        dst.put_u64_le(frame.conversation_id);
        dst.put_u8(frame.kind as u8);
        dst.put_u16_le(framelet_count);
        for framelet in &frame.framelets {
            dst.put_u16_le(framelet.framelet_type as u16);
            dst.put_u32_le(framelet.content.len() as u32);
            dst.put_slice(&framelet.content);
        }

        Ok(())
    }

    fn decode_body(mut body: Bytes) -> Result<Frame, CodecError> {
        let conversation_id = body.get_u64_le();
        let kind = MessageKind::try_from(body.get_u8())?;
        let count = body.get_u16_le();

        let mut frame = Frame::new(conversation_id, kind);
        for _ in 0..count {
            if body.remaining() < FRAMELET_HEADER_LEN {
                return Err(CodecError::InvalidFrame(
                    "truncated framelet header".to_string(),
                ));
            }
            let framelet_type = FrameletType::try_from(body.get_u16_le())?;
            let len = body.get_u32_le() as usize;
            if body.remaining() < len {
                return Err(CodecError::InvalidFrame(format!(
                    "framelet claims {len} bytes, {} left",
                    body.remaining()
                )));
            }
            frame = frame.with_framelet(framelet_type, body.split_to(len));
        }

        if body.has_remaining() {
            return Err(CodecError::InvalidFrame(format!(
                "{} trailing bytes after framelets",
                body.remaining()
            )));
        }

        frame.validate()?;
        Ok(frame)
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need at least 4 bytes for the length prefix
        if src.len() < 4 {
            return Ok(None);
        }

        let len = u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize;

        if len > self.max_frame_size {
            return Err(CodecError::FrameTooLarge {
                size: len,
                max: self.max_frame_size,
            });
        }
        if len < FRAME_HEADER_LEN {
            return Err(CodecError::InvalidFrame(format!(
                "frame body of {len} bytes is shorter than the header"
            )));
        }

        let total_len = 4 + len;
        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        src.advance(4);
        let body = src.split_to(len).freeze();
        Self::decode_body(body).map(Some)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.encode_frame(&item, dst)
    }
}

impl Encoder<&Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: &Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.encode_frame(item, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(id: u64, payload: &'static [u8]) -> Frame {
        Frame::message(
            id,
            MessageKind::Request,
            Some(Bytes::from_static(b"layer")),
            Some(Bytes::from_static(b"headers")),
            Bytes::from_static(payload),
        )
    }

    #[test]
    fn test_encode_decode_request() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        let frame = request(7, b"hello, world!");
        codec.encode_frame(&frame, &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.conversation_id, 7);
        assert_eq!(decoded.kind, MessageKind::Request);
        assert_eq!(decoded.layer_data().unwrap().as_ref(), b"layer");
        assert_eq!(decoded.headers().unwrap().as_ref(), b"headers");
        assert_eq!(decoded.payload().unwrap().as_ref(), b"hello, world!");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame() {
        let mut codec = FrameCodec::new();
        let mut encoded = BytesMut::new();
        codec
            .encode_frame(&request(1, b"helloworld"), &mut encoded)
            .unwrap();

        let mut buf = BytesMut::new();

        // Partial length prefix
        buf.put_slice(&encoded[..2]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        // Length prefix and part of the body
        buf.put_slice(&encoded[2..10]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        // Everything but the last byte
        buf.put_slice(&encoded[10..encoded.len() - 1]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.put_slice(&encoded[encoded.len() - 1..]);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.payload().unwrap().as_ref(), b"helloworld");
    }

    #[test]
    fn test_multiple_frames() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        codec.encode(request(1, b"first"), &mut buf).unwrap();
        codec
            .encode(Frame::control(Bytes::from_static(b"ctl")), &mut buf)
            .unwrap();
        codec.encode(request(3, b"third"), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().conversation_id, 1);
        let control = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(control.kind, MessageKind::Control);
        assert_eq!(control.conversation_id, CONTROL_CONVERSATION_ID);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().conversation_id, 3);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_frame_too_large() {
        let mut codec = FrameCodec::with_max_frame_size(100);
        let mut buf = BytesMut::new();

        let frame = Frame::message(
            1,
            MessageKind::Response,
            None,
            None,
            Bytes::from(vec![0u8; 200]),
        );
        let result = codec.encode(frame, &mut buf);
        assert!(matches!(result, Err(CodecError::FrameTooLarge { .. })));
    }

    #[test]
    fn test_decode_oversized_frame() {
        let mut codec = FrameCodec::with_max_frame_size(100);
        let mut buf = BytesMut::new();

        buf.put_u32_le(200);
        let result = codec.decode(&mut buf);
        assert!(matches!(result, Err(CodecError::FrameTooLarge { .. })));
    }

    #[test]
    fn test_decode_unknown_kind() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        buf.put_u32_le(FRAME_HEADER_LEN as u32);
        buf.put_u64_le(1);
        buf.put_u8(42);
        buf.put_u16_le(0);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::InvalidFrame(_))
        ));
    }

    #[test]
    fn test_decode_truncated_framelet() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        // One framelet that claims more bytes than the frame holds
        buf.put_u32_le((FRAME_HEADER_LEN + FRAMELET_HEADER_LEN + 2) as u32);
        buf.put_u64_le(1);
        buf.put_u8(MessageKind::Response as u8);
        buf.put_u16_le(1);
        buf.put_u16_le(FrameletType::Payload as u16);
        buf.put_u32_le(64);
        buf.put_slice(b"ab");

        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::InvalidFrame(_))
        ));
    }

    #[test]
    fn test_rejects_out_of_order_framelets() {
        let frame = Frame::new(1, MessageKind::Request)
            .with_framelet(FrameletType::Payload, Bytes::from_static(b"p"))
            .with_framelet(FrameletType::Headers, Bytes::from_static(b"h"));
        assert!(frame.validate().is_err());

        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        assert!(codec.encode_frame(&frame, &mut buf).is_err());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_framelet_sequences() {
        let payload = Bytes::from_static(b"p");

        // Responses carry no headers
        let response = Frame::message(2, MessageKind::Response, None, None, payload.clone());
        assert!(response.validate().is_ok());
        let response_with_headers = Frame::message(
            2,
            MessageKind::Response,
            None,
            Some(Bytes::from_static(b"h")),
            payload.clone(),
        );
        assert!(response_with_headers.validate().is_err());

        // Requests need headers
        let request = Frame::message(1, MessageKind::Request, None, None, payload);
        assert!(request.validate().is_err());

        // Control frames hold nothing but the control framelet
        let control = Frame::control(Bytes::from_static(b"c"))
            .with_framelet(FrameletType::Payload, Bytes::new());
        assert!(control.validate().is_err());
    }
}
