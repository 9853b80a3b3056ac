//! MMU wire protocol codec
//!
//! Messages are short ASCII lines: a one-letter code, hex-encoded values, a
//! `*` separator, a two-digit CRC8 and a terminating newline. Requests run
//! printer-to-MMU, responses echo the request they answer followed by a
//! parameter code and value:
//!
//! ```text
//! T1*cf\n        request: tool change to slot 1
//! T1 A*40\n      response: accepted
//! T1 P5*..\n     response: still processing, progress code 5
//! T1 F0*..\n     response: finished
//! ```

/// Request codes, one letter on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMsgCode {
    Query,
    Tool,
    Load,
    Unload,
    Version,
    Reset,
    Button,
    Eject,
    Write,
    Cut,
    FilamentSensor,
    Read,
    Home,
    Unknown,
}

impl RequestMsgCode {
    pub fn to_byte(self) -> u8 {
        match self {
            RequestMsgCode::Query => b'Q',
            RequestMsgCode::Tool => b'T',
            RequestMsgCode::Load => b'L',
            RequestMsgCode::Unload => b'U',
            RequestMsgCode::Version => b'S',
            RequestMsgCode::Reset => b'X',
            RequestMsgCode::Button => b'B',
            RequestMsgCode::Eject => b'E',
            RequestMsgCode::Write => b'W',
            RequestMsgCode::Cut => b'K',
            RequestMsgCode::FilamentSensor => b'f',
            RequestMsgCode::Read => b'R',
            RequestMsgCode::Home => b'H',
            RequestMsgCode::Unknown => 0,
        }
    }

    pub fn from_byte(b: u8) -> RequestMsgCode {
        match b {
            b'Q' => RequestMsgCode::Query,
            b'T' => RequestMsgCode::Tool,
            b'L' => RequestMsgCode::Load,
            b'U' => RequestMsgCode::Unload,
            b'S' => RequestMsgCode::Version,
            b'X' => RequestMsgCode::Reset,
            b'B' => RequestMsgCode::Button,
            b'E' => RequestMsgCode::Eject,
            b'W' => RequestMsgCode::Write,
            b'K' => RequestMsgCode::Cut,
            b'f' => RequestMsgCode::FilamentSensor,
            b'R' => RequestMsgCode::Read,
            b'H' => RequestMsgCode::Home,
            _ => RequestMsgCode::Unknown,
        }
    }
}

/// Response parameter codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMsgParamCode {
    Processing,
    Error,
    Finished,
    Accepted,
    Rejected,
    Button,
    Unknown,
}

impl ResponseMsgParamCode {
    pub fn to_byte(self) -> u8 {
        match self {
            ResponseMsgParamCode::Processing => b'P',
            ResponseMsgParamCode::Error => b'E',
            ResponseMsgParamCode::Finished => b'F',
            ResponseMsgParamCode::Accepted => b'A',
            ResponseMsgParamCode::Rejected => b'R',
            ResponseMsgParamCode::Button => b'B',
            ResponseMsgParamCode::Unknown => 0,
        }
    }

    pub fn from_byte(b: u8) -> ResponseMsgParamCode {
        match b {
            b'P' => ResponseMsgParamCode::Processing,
            b'E' => ResponseMsgParamCode::Error,
            b'F' => ResponseMsgParamCode::Finished,
            b'A' => ResponseMsgParamCode::Accepted,
            b'R' => ResponseMsgParamCode::Rejected,
            b'B' => ResponseMsgParamCode::Button,
            _ => ResponseMsgParamCode::Unknown,
        }
    }
}

/// One request. `value2` is only used by register writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestMsg {
    pub code: RequestMsgCode,
    pub value: u8,
    pub value2: u16,
}

impl RequestMsg {
    pub fn new(code: RequestMsgCode, value: u8) -> Self {
        Self {
            code,
            value,
            value2: 0,
        }
    }

    pub fn write(address: u8, value: u16) -> Self {
        Self {
            code: RequestMsgCode::Write,
            value: address,
            value2: value,
        }
    }
}

/// One response: the echoed request plus a parameter code and value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseMsg {
    pub request: RequestMsg,
    pub param_code: ResponseMsgParamCode,
    pub param_value: u16,
}

impl ResponseMsg {
    pub fn new(request: RequestMsg, param_code: ResponseMsgParamCode, param_value: u16) -> Self {
        Self {
            request,
            param_code,
            param_value,
        }
    }
}

/// Worst case: `Wff ffff*ff\n`
pub const MAX_REQUEST_SIZE: usize = 13;
/// Worst case: `Tf Effff*ff\n`
pub const MAX_RESPONSE_SIZE: usize = 14;

/// CRC8, polynomial 0x07, zero init, over everything before the `*`
pub fn crc8(data: &[u8]) -> u8 {
    let mut crc = 0u8;
    for &b in data {
        crc ^= b;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ 0x07
            } else {
                crc << 1
            };
        }
    }
    crc
}

fn push_hex(out: &mut Vec<u8>, value: u32) {
    let mut buf = [0u8; 8];
    let mut i = buf.len();
    let mut v = value;
    loop {
        i -= 1;
        buf[i] = char::from_digit(v & 0xf, 16).unwrap_or('0') as u8;
        v >>= 4;
        if v == 0 {
            break;
        }
    }
    out.extend_from_slice(&buf[i..]);
}

fn finish_frame(mut out: Vec<u8>) -> Vec<u8> {
    let crc = crc8(&out);
    out.push(b'*');
    push_hex(&mut out, u32::from(crc >> 4));
    push_hex(&mut out, u32::from(crc & 0xf));
    out.push(b'\n');
    out
}

/// Encode a request. Register writes carry both the address and the value.
pub fn encode_request(rq: &RequestMsg) -> Vec<u8> {
    let mut out = Vec::with_capacity(MAX_REQUEST_SIZE);
    out.push(rq.code.to_byte());
    push_hex(&mut out, u32::from(rq.value));
    if rq.code == RequestMsgCode::Write {
        out.push(b' ');
        push_hex(&mut out, u32::from(rq.value2));
    }
    finish_frame(out)
}

/// Encode a response as the MMU would send it
pub fn encode_response(rsp: &ResponseMsg) -> Vec<u8> {
    let mut out = Vec::with_capacity(MAX_RESPONSE_SIZE);
    out.push(rsp.request.code.to_byte());
    push_hex(&mut out, u32::from(rsp.request.value));
    out.push(b' ');
    out.push(rsp.param_code.to_byte());
    push_hex(&mut out, u32::from(rsp.param_value));
    finish_frame(out)
}

fn split_crc(frame: &[u8]) -> Option<(&[u8], u8)> {
    let star = frame.iter().position(|&b| b == b'*')?;
    let crc = parse_hex(&frame[star + 1..])?;
    if crc > 0xff {
        return None;
    }
    Some((&frame[..star], crc as u8))
}

fn parse_hex(digits: &[u8]) -> Option<u32> {
    if digits.is_empty() || digits.len() > 8 {
        return None;
    }
    let mut v = 0u32;
    for &d in digits {
        v = (v << 4) | (d as char).to_digit(16)?;
    }
    Some(v)
}

/// Decode a complete request frame (everything up to, not including, the
/// terminating newline)
pub fn decode_request(frame: &[u8]) -> Option<RequestMsg> {
    let (body, crc) = split_crc(frame)?;
    if crc8(body) != crc || body.is_empty() {
        return None;
    }
    let code = RequestMsgCode::from_byte(body[0]);
    if code == RequestMsgCode::Unknown {
        return None;
    }
    let rest = &body[1..];
    match rest.iter().position(|&b| b == b' ') {
        Some(sep) if code == RequestMsgCode::Write => {
            let address = parse_hex(&rest[..sep])?;
            let value = parse_hex(&rest[sep + 1..])?;
            if address > 0xff || value > 0xffff {
                return None;
            }
            Some(RequestMsg::write(address as u8, value as u16))
        }
        Some(_) => None,
        None => {
            let value = parse_hex(rest)?;
            if value > 0xff {
                return None;
            }
            Some(RequestMsg::new(code, value as u8))
        }
    }
}

fn decode_response(frame: &[u8]) -> Option<ResponseMsg> {
    let (body, crc) = split_crc(frame)?;
    if crc8(body) != crc || body.len() < 4 {
        return None;
    }
    let code = RequestMsgCode::from_byte(body[0]);
    if code == RequestMsgCode::Unknown {
        return None;
    }
    let sep = body.iter().position(|&b| b == b' ')?;
    let value = parse_hex(&body[1..sep])?;
    if value > 0xff {
        return None;
    }
    let param = &body[sep + 1..];
    let param_code = ResponseMsgParamCode::from_byte(*param.first()?);
    if param_code == ResponseMsgParamCode::Unknown {
        return None;
    }
    // a bare code is allowed ("X0 F")
    let param_value = if param.len() > 1 {
        let v = parse_hex(&param[1..])?;
        if v > 0xffff {
            return None;
        }
        v as u16
    } else {
        0
    };
    Some(ResponseMsg::new(
        RequestMsg::new(code, value as u8),
        param_code,
        param_value,
    ))
}

/// Outcome of feeding one byte to the [`ResponseDecoder`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStatus {
    NeedMoreData,
    MessageCompleted,
    Error,
}

/// Incremental response decoder. Bytes accumulate until a newline; the
/// completed frame is then parsed and CRC-checked in one go. Oversized or
/// malformed frames surface as [`DecodeStatus::Error`] and the buffer
/// resets so the stream can resynchronize on the next newline.
#[derive(Debug, Default)]
pub struct ResponseDecoder {
    buffer: Vec<u8>,
    msg: Option<ResponseMsg>,
}

impl ResponseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, byte: u8) -> DecodeStatus {
        if byte == b'\n' {
            let frame = std::mem::take(&mut self.buffer);
            match decode_response(&frame) {
                Some(msg) => {
                    self.msg = Some(msg);
                    DecodeStatus::MessageCompleted
                }
                None => DecodeStatus::Error,
            }
        } else if self.buffer.len() >= MAX_RESPONSE_SIZE {
            self.buffer.clear();
            DecodeStatus::Error
        } else {
            self.buffer.push(byte);
            DecodeStatus::NeedMoreData
        }
    }

    /// The last completed message
    pub fn take_message(&mut self) -> Option<ResponseMsg> {
        self.msg.take()
    }

    pub fn reset(&mut self) {
        self.buffer.clear();
        self.msg = None;
    }
}
