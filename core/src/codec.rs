use prost::Message;
use prost_reflect::{DynamicMessage, MessageDescriptor};
use tonic::codec::{BufferSettings, Codec, Decoder, Encoder};
use tonic::Status;

/// A gRPC codec for prost-reflect DynamicMessage.
///
/// Unlike tonic's ProstCodec which works with compile-time generated types,
/// this codec works with runtime-resolved message descriptors, enabling
/// dynamic dispatch without pre-compiled service stubs. `decode_desc` is the
/// type of the message read off the wire, `encode_desc` the type written to
/// it — which role is "request" vs "response" flips between server and
/// client use, so the two constructors below name the role explicitly
/// instead of assuming a fixed request/response direction.
pub struct DynamicCodec {
    decode_desc: MessageDescriptor,
    encode_desc: MessageDescriptor,
}

impl DynamicCodec {
    /// Server-side codec: decodes the incoming request, encodes the outgoing
    /// response. Used by the dispatch table.
    pub fn new_server(request_desc: MessageDescriptor, response_desc: MessageDescriptor) -> Self {
        DynamicCodec {
            decode_desc: request_desc,
            encode_desc: response_desc,
        }
    }

    /// Client-side codec: encodes the outgoing request, decodes the inbound
    /// response. Used by the proxy channel cache when forwarding calls to an
    /// upstream server.
    pub fn new_client(request_desc: MessageDescriptor, response_desc: MessageDescriptor) -> Self {
        DynamicCodec {
            decode_desc: response_desc,
            encode_desc: request_desc,
        }
    }
}

impl Codec for DynamicCodec {
    type Encode = DynamicMessage;
    type Decode = DynamicMessage;
    type Encoder = DynamicEncoder;
    type Decoder = DynamicDecoder;

    fn encoder(&mut self) -> Self::Encoder {
        DynamicEncoder {
            _encode_desc: self.encode_desc.clone(),
        }
    }

    fn decoder(&mut self) -> Self::Decoder {
        DynamicDecoder {
            decode_desc: self.decode_desc.clone(),
        }
    }
}

/// Encodes DynamicMessage into protobuf wire format.
pub struct DynamicEncoder {
    _encode_desc: MessageDescriptor,
}

impl Encoder for DynamicEncoder {
    type Item = DynamicMessage;
    type Error = Status;

    fn encode(
        &mut self,
        item: Self::Item,
        dst: &mut tonic::codec::EncodeBuf<'_>,
    ) -> Result<(), Self::Error> {
        item.encode(dst)
            .map_err(|e| Status::internal(format!("failed to encode message: {e}")))?;
        Ok(())
    }

    fn buffer_settings(&self) -> BufferSettings {
        BufferSettings::default()
    }
}

/// Decodes protobuf wire format into DynamicMessage.
pub struct DynamicDecoder {
    decode_desc: MessageDescriptor,
}

impl Decoder for DynamicDecoder {
    type Item = DynamicMessage;
    type Error = Status;

    fn decode(
        &mut self,
        src: &mut tonic::codec::DecodeBuf<'_>,
    ) -> Result<Option<Self::Item>, Self::Error> {
        let msg = DynamicMessage::decode(self.decode_desc.clone(), src)
            .map_err(|e| Status::internal(format!("failed to decode message: {e}")))?;
        Ok(Some(msg))
    }

    fn buffer_settings(&self) -> BufferSettings {
        BufferSettings::default()
    }
}
