//! MMU link abstraction
//!
//! The protocol logic is transport-agnostic: it emits [`RequestMsg`]s and
//! polls for [`ResponseMsg`]s through [`MmuLink`]. Two implementations
//! exist, one framing messages over a byte stream ([`SerialMmuLink`]) and
//! one mapping them onto a register bus ([`RegisterMmuLink`]), so the
//! state machine itself carries no transport conditionals.

use super::protocol::{
    encode_request, DecodeStatus, RequestMsg, RequestMsgCode, ResponseDecoder, ResponseMsg,
    ResponseMsgParamCode,
};
use crate::error::{Error, Result};
use crate::transport::Transport;

/// Register-bus addresses with a protocol-level meaning. Version fields
/// occupy the first registers, so a read at or below
/// [`LAST_VERSION_REGISTER`] answers a `Version` request.
pub const LAST_VERSION_REGISTER: u8 = 3;
/// Writes here push a user button index to the MMU
pub const BUTTON_REGISTER: u8 = 0xfc;
/// Writes here report the printer's filament sensor state
pub const FILAMENT_SENSOR_REGISTER: u8 = 0xfe;

/// Half-duplex request/response channel to the MMU.
///
/// `poll_response` never blocks; a malformed or unparseable reply is
/// [`Error::InvalidPacket`], which the protocol logic treats as a
/// protocol error rather than an I/O failure.
pub trait MmuLink {
    fn send(&mut self, rq: &RequestMsg) -> Result<()>;
    fn poll_response(&mut self) -> Result<Option<ResponseMsg>>;
    /// Drop any partially decoded frame
    fn reset_decoder(&mut self);
    /// Discard all pending data in both directions
    fn purge(&mut self) -> Result<()>;
}

/// Byte-stream link: the text codec over a [`Transport`]
pub struct SerialMmuLink<T: Transport> {
    transport: T,
    decoder: ResponseDecoder,
}

impl<T: Transport> SerialMmuLink<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            decoder: ResponseDecoder::new(),
        }
    }
}

impl<T: Transport> MmuLink for SerialMmuLink<T> {
    fn send(&mut self, rq: &RequestMsg) -> Result<()> {
        let frame = encode_request(rq);
        self.transport.write(&frame)?;
        Ok(())
    }

    fn poll_response(&mut self) -> Result<Option<ResponseMsg>> {
        let mut byte = [0u8; 1];
        while self.transport.read(&mut byte)? > 0 {
            match self.decoder.decode(byte[0]) {
                DecodeStatus::MessageCompleted => return Ok(self.decoder.take_message()),
                DecodeStatus::NeedMoreData => {}
                DecodeStatus::Error => {
                    return Err(Error::InvalidPacket(
                        "undecodable response frame".to_string(),
                    ))
                }
            }
        }
        Ok(None)
    }

    fn reset_decoder(&mut self) {
        self.decoder.reset();
    }

    fn purge(&mut self) -> Result<()> {
        self.decoder.reset();
        self.transport.purge()
    }
}

/// Completed exchange reported by a [`RegisterBus`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusReply {
    Read {
        address: u8,
        accepted: bool,
        value: u16,
    },
    Write {
        address: u8,
        accepted: bool,
        value: u16,
    },
    /// Reply to a command or query: the command the MMU is (or was)
    /// executing, its status code and the progress/error value
    Command {
        command: u8,
        param: u8,
        status: u8,
        value: u16,
    },
}

/// Modbus-like bus the register variant of the MMU hangs off. Requests
/// are posted asynchronously; the completed exchange is collected with
/// `take_reply`.
pub trait RegisterBus {
    fn post_read(&mut self, address: u8) -> Result<()>;
    fn post_write(&mut self, address: u8, value: u16) -> Result<()>;
    fn post_command(&mut self, command: u8, param: u8) -> Result<()>;
    fn post_query(&mut self) -> Result<()>;
    fn take_reply(&mut self) -> Result<Option<BusReply>>;
    fn purge(&mut self) -> Result<()>;
}

/// Register-bus link: maps protocol requests onto bus operations and bus
/// replies back onto uniform [`ResponseMsg`]s
pub struct RegisterMmuLink<B: RegisterBus> {
    bus: B,
}

impl<B: RegisterBus> RegisterMmuLink<B> {
    pub fn new(bus: B) -> Self {
        Self { bus }
    }

    fn map_reply(reply: BusReply) -> Result<ResponseMsg> {
        let accepted = |ok: bool| {
            if ok {
                ResponseMsgParamCode::Accepted
            } else {
                ResponseMsgParamCode::Rejected
            }
        };
        match reply {
            BusReply::Read {
                address,
                accepted: ok,
                value,
            } => {
                // low registers hold the firmware version fields
                let code = if address <= LAST_VERSION_REGISTER {
                    RequestMsgCode::Version
                } else {
                    RequestMsgCode::Read
                };
                Ok(ResponseMsg::new(
                    RequestMsg::new(code, address),
                    accepted(ok),
                    value,
                ))
            }
            BusReply::Write {
                address,
                accepted: ok,
                value,
            } => Ok(ResponseMsg::new(
                RequestMsg::write(address, value),
                accepted(ok),
                value,
            )),
            BusReply::Command {
                command,
                param,
                status,
                value,
            } => {
                let code = RequestMsgCode::from_byte(command);
                let param_code = ResponseMsgParamCode::from_byte(status);
                if code == RequestMsgCode::Unknown || param_code == ResponseMsgParamCode::Unknown {
                    return Err(Error::InvalidPacket(format!(
                        "unknown bus command reply {:#04x}/{:#04x}",
                        command, status
                    )));
                }
                Ok(ResponseMsg::new(
                    RequestMsg::new(code, param),
                    param_code,
                    value,
                ))
            }
        }
    }
}

impl<B: RegisterBus> MmuLink for RegisterMmuLink<B> {
    fn send(&mut self, rq: &RequestMsg) -> Result<()> {
        match rq.code {
            RequestMsgCode::Query => self.bus.post_query(),
            RequestMsgCode::Version | RequestMsgCode::Read => self.bus.post_read(rq.value),
            RequestMsgCode::Write => self.bus.post_write(rq.value, rq.value2),
            RequestMsgCode::Button => self.bus.post_write(BUTTON_REGISTER, u16::from(rq.value)),
            RequestMsgCode::FilamentSensor => self
                .bus
                .post_write(FILAMENT_SENSOR_REGISTER, u16::from(rq.value)),
            _ => self.bus.post_command(rq.code.to_byte(), rq.value),
        }
    }

    fn poll_response(&mut self) -> Result<Option<ResponseMsg>> {
        match self.bus.take_reply()? {
            Some(reply) => Self::map_reply(reply).map(Some),
            None => Ok(None),
        }
    }

    fn reset_decoder(&mut self) {
        // nothing buffered: framing is the bus's problem
    }

    fn purge(&mut self) -> Result<()> {
        self.bus.purge()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmu::protocol::encode_response;
    use crate::transport::MockTransport;

    #[test]
    fn test_serial_link_round_trip() {
        let transport = MockTransport::new();
        let mut link = SerialMmuLink::new(transport.clone());

        link.send(&RequestMsg::new(RequestMsgCode::Query, 0)).unwrap();
        assert_eq!(transport.take_written(), b"Q0*89\n".to_vec());

        let rsp = ResponseMsg::new(
            RequestMsg::new(RequestMsgCode::Query, 0),
            ResponseMsgParamCode::Finished,
            0,
        );
        transport.inject_read(&encode_response(&rsp));
        assert_eq!(link.poll_response().unwrap(), Some(rsp));
        assert_eq!(link.poll_response().unwrap(), None);
    }

    #[test]
    fn test_serial_link_garbage_is_invalid_packet() {
        let transport = MockTransport::new();
        let mut link = SerialMmuLink::new(transport.clone());
        transport.inject_read(b"nonsense\n");
        assert!(matches!(
            link.poll_response(),
            Err(Error::InvalidPacket(_))
        ));
    }

    struct OneShotBus(Option<BusReply>);

    impl RegisterBus for OneShotBus {
        fn post_read(&mut self, _address: u8) -> Result<()> {
            Ok(())
        }
        fn post_write(&mut self, _address: u8, _value: u16) -> Result<()> {
            Ok(())
        }
        fn post_command(&mut self, _command: u8, _param: u8) -> Result<()> {
            Ok(())
        }
        fn post_query(&mut self) -> Result<()> {
            Ok(())
        }
        fn take_reply(&mut self) -> Result<Option<BusReply>> {
            Ok(self.0.take())
        }
        fn purge(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_register_link_maps_low_reads_to_version() {
        let mut link = RegisterMmuLink::new(OneShotBus(Some(BusReply::Read {
            address: 1,
            accepted: true,
            value: 3,
        })));
        let rsp = link.poll_response().unwrap().unwrap();
        assert_eq!(rsp.request.code, RequestMsgCode::Version);
        assert_eq!(rsp.request.value, 1);
        assert_eq!(rsp.param_code, ResponseMsgParamCode::Accepted);
        assert_eq!(rsp.param_value, 3);
    }

    #[test]
    fn test_register_link_maps_command_progress() {
        let mut link = RegisterMmuLink::new(OneShotBus(Some(BusReply::Command {
            command: b'T',
            param: 2,
            status: b'P',
            value: 5,
        })));
        let rsp = link.poll_response().unwrap().unwrap();
        assert_eq!(rsp.request, RequestMsg::new(RequestMsgCode::Tool, 2));
        assert_eq!(rsp.param_code, ResponseMsgParamCode::Processing);
        assert_eq!(rsp.param_value, 5);
    }
}
