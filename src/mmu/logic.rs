//! MMU protocol state machine
//!
//! [`ProtocolLogic`] owns the request/response choreography with the MMU:
//! the version handshake, init-register parametrization, the idle
//! heartbeat with its register battery, and command execution with
//! progress polling. It is stepped cooperatively from the host loop and
//! never blocks; every call either advances the exchange or reports a
//! status for the caller to act on.
//!
//! Timeouts and decode errors go through a recovery path instead of
//! surfacing immediately: a communication timeout restarts the handshake,
//! a protocol error waits out a heartbeat first (the peer may be
//! rebooting), and the [`DropOutFilter`] absorbs short self-correcting
//! outages entirely.

use super::protocol::{RequestMsg, RequestMsgCode, ResponseMsg, ResponseMsgParamCode};
use super::transport::MmuLink;
use crate::config::MmuConfig;
use crate::error::{Error, Result};
use std::time::{Duration, Instant};

/// MMU register addresses used by the periodic polls
pub mod registers {
    /// Error statistics counter
    pub const MMU_ERRORS: u8 = 0x04;
    /// FINDA filament detector state
    pub const FINDA_STATE: u8 = 0x08;
    /// Extra filament load distance (mm)
    pub const EXTRA_LOAD_DISTANCE: u8 = 0x0b;
    /// Pulley slow feedrate (mm/s)
    pub const PULLEY_SLOW_FEEDRATE: u8 = 0x14;
    /// Pulley position (mm)
    pub const PULLEY_POSITION: u8 = 0x1a;
    /// Current selector slot
    pub const SELECTOR_SLOT: u8 = 0x1b;
    /// Current idler slot
    pub const IDLER_SLOT: u8 = 0x1c;
}

/// 8-bit registers read on every heartbeat
const REGS8_ADDRS: [u8; 3] = [
    registers::FINDA_STATE,
    registers::SELECTOR_SLOT,
    registers::IDLER_SLOT,
];

/// 16-bit registers read on every heartbeat
const REGS16_ADDRS: [u8; 2] = [registers::MMU_ERRORS, registers::PULLEY_POSITION];

/// Registers written once after a successful handshake
const INIT_REGS_ADDRS: [u8; 2] = [
    registers::EXTRA_LOAD_DISTANCE,
    registers::PULLEY_SLOW_FEEDRATE,
];

/// Error pseudo-code: no error
pub const ERROR_OK: u16 = 0;
/// Error pseudo-code: a command is running. Real MMU error codes arrive
/// in `E` responses and are passed through verbatim.
pub const ERROR_RUNNING: u16 = 0xffff;
/// Error pseudo-code: the peer rejected or garbled an exchange
pub const ERROR_PROTOCOL: u16 = 0xfffe;
/// Progress pseudo-code: idle / done
pub const PROGRESS_OK: u16 = 0;
/// Progress pseudo-code: an error is waiting for user interaction
pub const PROGRESS_WAITING_FOR_USER: u16 = 0xffff;

/// Caller-visible outcome of one [`ProtocolLogic::step`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    /// The exchange is progressing, call again
    Processing,
    /// Internal marker: a complete response has been decoded
    MessageReady,
    /// The current exchange (idle cycle or command) completed
    Finished,
    /// The MMU rejected the active command; it is being re-sent
    CommandRejected,
    /// The active command failed on the MMU, see `error_code`
    CommandError,
    /// The MMU firmware is incompatible with this driver
    VersionMismatch,
    /// Undecodable or unexpected traffic; recovery is underway
    ProtocolError,
    /// No traffic within the link timeout; handshake is restarting
    CommunicationTimeout,
    /// The user pushed a button on the MMU, see `take_button`
    ButtonPushed,
    /// A different command finished than the one issued
    Interrupted,
    /// An explicit printer-side error overrides the MMU state
    PrinterError,
}

/// Major phase of the exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    Stopped,
    StartSeq,
    DelayedRestart,
    Idle,
    Command,
}

/// Fine-grained sub-step within a scope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScopeState {
    Ready,
    Wait,
    S0Sent,
    S1Sent,
    S2Sent,
    S3Sent,
    WritingInitRegisters,
    FilamentSensorStateSent,
    QuerySent,
    CommandSent,
    Reading8bitRegisters,
    Reading16bitRegisters,
    ButtonSent,
    ReadRegisterSent,
    WriteRegisterSent,
    RecoveringProtocolError,
}

/// Short-outage suppressor: `max_occurrences` consecutive drop-out-class
/// failures are required before the first recorded cause is surfaced;
/// anything shorter is absorbed as [`StepStatus::Processing`].
#[derive(Debug)]
pub struct DropOutFilter {
    cause: StepStatus,
    max_occurrences: u8,
    occurrences: u8,
}

impl DropOutFilter {
    pub fn new(max_occurrences: u8) -> Self {
        Self {
            cause: StepStatus::Processing,
            max_occurrences,
            occurrences: max_occurrences,
        }
    }

    /// Record one failure; true when the run is long enough to report.
    /// A zero occurrence budget disables suppression entirely.
    pub fn record(&mut self, cause: StepStatus) -> bool {
        if self.occurrences == self.max_occurrences {
            self.cause = cause;
        }
        self.occurrences = self.occurrences.saturating_sub(1);
        self.occurrences == 0
    }

    /// First cause recorded in the current run
    pub fn initial_cause(&self) -> StepStatus {
        self.cause
    }

    pub fn reset(&mut self) {
        self.occurrences = self.max_occurrences;
    }
}

/// The protocol state machine over an abstract [`MmuLink`].
///
/// Time is passed into [`ProtocolLogic::step`] explicitly, so tests can
/// drive timeouts without sleeping.
pub struct ProtocolLogic<L: MmuLink> {
    link: L,

    scope: Scope,
    scope_state: ScopeState,
    rq: RequestMsg,
    planned_rq: RequestMsg,
    rsp: ResponseMsg,

    now: Instant,
    last_activity: Instant,
    heartbeat: Duration,
    link_timeout: Duration,

    supported_version: [u8; 3],
    mmu_version: [u8; 3],
    mmu_build: u16,
    retries: u8,
    max_retries: u8,

    init_regs: [u16; 2],
    regs8: [u8; 3],
    regs16: [u16; 2],
    reg_index: usize,
    register_value: Option<u16>,

    dropout: DropOutFilter,

    error_code: u16,
    progress_code: u16,
    button_code: Option<u8>,
    printer_error: Option<u16>,

    filament_state: u8,
    last_fsensor: u8,

    retry_attempts: u8,
    max_retry_attempts: u8,
    in_auto_retry: bool,
}

impl<L: MmuLink> ProtocolLogic<L> {
    pub fn new(link: L, cfg: &MmuConfig) -> Self {
        let now = Instant::now();
        Self {
            link,
            scope: Scope::Stopped,
            scope_state: ScopeState::Ready,
            rq: RequestMsg::new(RequestMsgCode::Unknown, 0),
            planned_rq: RequestMsg::new(RequestMsgCode::Unknown, 0),
            rsp: ResponseMsg::new(
                RequestMsg::new(RequestMsgCode::Unknown, 0),
                ResponseMsgParamCode::Unknown,
                0,
            ),
            now,
            last_activity: now,
            heartbeat: Duration::from_millis(cfg.heartbeat_period_ms),
            link_timeout: Duration::from_millis(cfg.link_timeout_ms),
            supported_version: cfg.supported_version,
            mmu_version: [0; 3],
            mmu_build: 0,
            retries: cfg.version_retries,
            max_retries: cfg.version_retries,
            init_regs: [
                u16::from(cfg.extra_load_distance),
                u16::from(cfg.pulley_slow_feedrate),
            ],
            regs8: [0; 3],
            regs16: [0; 2],
            reg_index: 0,
            register_value: None,
            dropout: DropOutFilter::new(cfg.dropout_occurrences),
            error_code: ERROR_OK,
            progress_code: PROGRESS_OK,
            button_code: None,
            printer_error: None,
            filament_state: 0,
            last_fsensor: 0,
            retry_attempts: cfg.button_retries,
            max_retry_attempts: cfg.button_retries,
            in_auto_retry: false,
        }
    }

    /// Begin (or restart) the version handshake
    pub fn start(&mut self, now: Instant) -> Result<()> {
        self.now = now;
        self.last_activity = now;
        self.restart_handshake()
    }

    pub fn stop(&mut self) {
        self.scope = Scope::Stopped;
        self.scope_state = ScopeState::Ready;
    }

    /// Advance the state machine by one non-blocking step
    pub fn step(&mut self, now: Instant) -> Result<StepStatus> {
        self.now = now;
        if !self.expects_response() {
            self.activate_planned_request()?;
        }
        let mut status = self.scope_step()?;
        match status {
            StepStatus::Finished => {
                // a freshly planned request takes over the channel before
                // we report the idle cycle as done
                if !self.activate_planned_request()? {
                    self.switch_to_idle();
                } else if self.expects_response() {
                    status = StepStatus::Processing;
                }
            }
            StepStatus::CommandRejected => {
                log::warn!("mmu rejected {:?}, re-sending", self.rq.code);
                self.command_restart()?;
            }
            StepStatus::CommandError => {
                log::warn!("mmu command error {:#06x}", self.error_code);
            }
            StepStatus::VersionMismatch => {
                log::error!(
                    "mmu version {:?} incompatible with supported {:?}",
                    self.mmu_version,
                    self.supported_version
                );
            }
            StepStatus::ProtocolError => {
                status = self.handle_protocol_error()?;
            }
            StepStatus::CommunicationTimeout => {
                status = self.handle_communication_timeout()?;
            }
            _ => {}
        }
        if self.printer_error.is_some() {
            return Ok(StepStatus::PrinterError);
        }
        Ok(status)
    }

    // --- request planning -------------------------------------------------

    pub fn tool_change(&mut self, slot: u8) -> Result<()> {
        self.plan_request(RequestMsg::new(RequestMsgCode::Tool, slot))
    }

    pub fn load_filament(&mut self, slot: u8) -> Result<()> {
        self.plan_request(RequestMsg::new(RequestMsgCode::Load, slot))
    }

    pub fn unload_filament(&mut self) -> Result<()> {
        self.plan_request(RequestMsg::new(RequestMsgCode::Unload, 0))
    }

    pub fn eject_filament(&mut self, slot: u8) -> Result<()> {
        self.plan_request(RequestMsg::new(RequestMsgCode::Eject, slot))
    }

    pub fn cut_filament(&mut self, slot: u8) -> Result<()> {
        self.plan_request(RequestMsg::new(RequestMsgCode::Cut, slot))
    }

    pub fn home(&mut self, mode: u8) -> Result<()> {
        self.plan_request(RequestMsg::new(RequestMsgCode::Home, mode))
    }

    pub fn reset_mmu(&mut self, mode: u8) -> Result<()> {
        self.plan_request(RequestMsg::new(RequestMsgCode::Reset, mode))
    }

    pub fn button(&mut self, index: u8) -> Result<()> {
        self.plan_request(RequestMsg::new(RequestMsgCode::Button, index))
    }

    pub fn read_register(&mut self, address: u8) -> Result<()> {
        self.plan_request(RequestMsg::new(RequestMsgCode::Read, address))
    }

    pub fn write_register(&mut self, address: u8, value: u16) -> Result<()> {
        self.plan_request(RequestMsg::write(address, value))
    }

    // --- host-side state --------------------------------------------------

    /// Report the printer's filament sensor state; a change is pushed to
    /// the MMU at the next opportunity even mid-command
    pub fn set_filament_state(&mut self, state: u8) {
        self.filament_state = state;
    }

    /// Force a printer-side error to override every status until cleared
    pub fn set_printer_error(&mut self, code: u16) {
        self.printer_error = Some(code);
    }

    pub fn clear_printer_error(&mut self) {
        self.printer_error = None;
    }

    pub fn error_code(&self) -> u16 {
        self.error_code
    }

    pub fn progress_code(&self) -> u16 {
        self.progress_code
    }

    /// Consume the last button index pushed on the MMU
    pub fn take_button(&mut self) -> Option<u8> {
        self.button_code.take()
    }

    /// Consume the value of the last explicit register read
    pub fn take_register_value(&mut self) -> Option<u16> {
        self.register_value.take()
    }

    pub fn command_in_progress(&self) -> Option<RequestMsgCode> {
        (self.scope == Scope::Command).then_some(self.rq.code)
    }

    pub fn fw_version(&self) -> [u8; 3] {
        self.mmu_version
    }

    pub fn fw_build(&self) -> u16 {
        self.mmu_build
    }

    /// Heartbeat register snapshots (FINDA, selector slot, idler slot)
    pub fn regs8(&self) -> [u8; 3] {
        self.regs8
    }

    /// Heartbeat register snapshots (error count, pulley position)
    pub fn regs16(&self) -> [u16; 2] {
        self.regs16
    }

    /// Enable counting of automatic button retries
    pub fn set_auto_retry(&mut self, enabled: bool) {
        self.in_auto_retry = enabled;
    }

    pub fn retry_attempts(&self) -> u8 {
        self.retry_attempts
    }

    pub fn reset_retry_attempts(&mut self) {
        self.retry_attempts = self.max_retry_attempts;
    }

    // --- sending ----------------------------------------------------------

    fn send_msg(&mut self, rq: RequestMsg) -> Result<()> {
        log::trace!("> {:?}", rq);
        self.link.send(&rq)?;
        self.last_activity = self.now;
        Ok(())
    }

    fn send_version(&mut self, stage: u8) -> Result<()> {
        self.send_msg(RequestMsg::new(RequestMsgCode::Version, stage))?;
        self.scope_state = match stage {
            0 => ScopeState::S0Sent,
            1 => ScopeState::S1Sent,
            2 => ScopeState::S2Sent,
            _ => ScopeState::S3Sent,
        };
        Ok(())
    }

    fn send_query(&mut self) -> Result<()> {
        self.send_msg(RequestMsg::new(RequestMsgCode::Query, 0))?;
        self.scope_state = ScopeState::QuerySent;
        Ok(())
    }

    fn send_read_register(&mut self, address: u8, next: ScopeState) -> Result<()> {
        self.send_msg(RequestMsg::new(RequestMsgCode::Read, address))?;
        self.scope_state = next;
        Ok(())
    }

    fn send_write_register(&mut self, address: u8, value: u16, next: ScopeState) -> Result<()> {
        self.send_msg(RequestMsg::write(address, value))?;
        self.scope_state = next;
        Ok(())
    }

    fn send_button(&mut self, index: u8) -> Result<()> {
        self.send_msg(RequestMsg::new(RequestMsgCode::Button, index))?;
        self.scope_state = ScopeState::ButtonSent;
        Ok(())
    }

    fn send_and_update_filament_sensor(&mut self) -> Result<()> {
        self.last_fsensor = self.filament_state;
        self.send_msg(RequestMsg::new(
            RequestMsgCode::FilamentSensor,
            self.last_fsensor,
        ))?;
        self.scope_state = ScopeState::FilamentSensorStateSent;
        Ok(())
    }

    /// A filament sensor change must reach the MMU even between
    /// heartbeats; motion synchronization on the MMU depends on it
    fn check_async_events(&mut self) -> Result<()> {
        if self.filament_state != self.last_fsensor {
            self.send_and_update_filament_sensor()?;
        }
        Ok(())
    }

    // --- register batteries -----------------------------------------------

    fn start_reading_8bit_registers(&mut self) -> Result<()> {
        self.reg_index = 0;
        self.send_read_register(REGS8_ADDRS[0], ScopeState::Reading8bitRegisters)
    }

    fn process_read_8bit_register(&mut self) -> Result<()> {
        self.regs8[self.reg_index] = self.rsp.param_value as u8;
        self.reg_index += 1;
        if self.reg_index >= REGS8_ADDRS.len() {
            self.start_reading_16bit_registers()
        } else {
            self.send_read_register(REGS8_ADDRS[self.reg_index], ScopeState::Reading8bitRegisters)
        }
    }

    fn start_reading_16bit_registers(&mut self) -> Result<()> {
        self.reg_index = 0;
        self.send_read_register(REGS16_ADDRS[0], ScopeState::Reading16bitRegisters)
    }

    fn process_read_16bit_register(&mut self, state_at_end: ScopeState) -> Result<ScopeState> {
        self.regs16[self.reg_index] = self.rsp.param_value;
        self.reg_index += 1;
        if self.reg_index >= REGS16_ADDRS.len() {
            return Ok(state_at_end);
        }
        self.send_read_register(REGS16_ADDRS[self.reg_index], ScopeState::Reading16bitRegisters)?;
        Ok(ScopeState::Reading16bitRegisters)
    }

    fn start_writing_init_registers(&mut self) -> Result<()> {
        self.reg_index = 0;
        self.send_write_register(
            INIT_REGS_ADDRS[0],
            self.init_regs[0],
            ScopeState::WritingInitRegisters,
        )
    }

    /// True once the last init register has been acknowledged
    fn process_writing_init_register(&mut self) -> Result<bool> {
        self.reg_index += 1;
        if self.reg_index >= INIT_REGS_ADDRS.len() {
            return Ok(true);
        }
        self.send_write_register(
            INIT_REGS_ADDRS[self.reg_index],
            self.init_regs[self.reg_index],
            ScopeState::WritingInitRegisters,
        )?;
        Ok(false)
    }

    // --- stepping ---------------------------------------------------------

    fn expects_response(&self) -> bool {
        !matches!(
            self.scope_state,
            ScopeState::Ready | ScopeState::Wait | ScopeState::RecoveringProtocolError
        )
    }

    fn elapsed(&self, timeout: Duration) -> bool {
        self.now.saturating_duration_since(self.last_activity) >= timeout
    }

    fn expecting_message(&mut self) -> Result<StepStatus> {
        match self.link.poll_response() {
            Ok(Some(rsp)) => {
                log::trace!("< {:?}", rsp);
                self.rsp = rsp;
                self.last_activity = self.now;
                Ok(StepStatus::MessageReady)
            }
            Ok(None) => {
                if self.elapsed(self.link_timeout) && self.scope != Scope::Stopped {
                    Ok(StepStatus::CommunicationTimeout)
                } else {
                    Ok(StepStatus::Processing)
                }
            }
            Err(Error::InvalidPacket(reason)) => {
                log::warn!("mmu link: {}", reason);
                self.last_activity = self.now;
                Ok(StepStatus::ProtocolError)
            }
            Err(e) => Err(e),
        }
    }

    fn scope_step(&mut self) -> Result<StepStatus> {
        if !self.expects_response() {
            return match self.scope {
                Scope::DelayedRestart => self.delayed_restart_wait(),
                Scope::Idle => self.idle_wait(),
                Scope::Command => self.command_wait(),
                Scope::StartSeq | Scope::Stopped => Ok(StepStatus::Processing),
            };
        }

        let status = self.expecting_message()?;
        if status != StepStatus::MessageReady {
            return Ok(status);
        }

        match self.scope {
            Scope::StartSeq => self.start_seq_step(),
            Scope::Idle => self.idle_step(),
            Scope::Command => self.command_step(),
            Scope::DelayedRestart | Scope::Stopped => Ok(StepStatus::Processing),
        }
    }

    fn restart_handshake(&mut self) -> Result<()> {
        self.scope = Scope::StartSeq;
        self.link.reset_decoder();
        self.retries = self.max_retries;
        self.send_version(0)
    }

    fn process_version_response(&mut self, stage: u8) -> Result<StepStatus> {
        if self.rsp.request.code != RequestMsgCode::Version || self.rsp.request.value != stage {
            // response to something else, protocol corruption: repeat
            self.send_version(stage)?;
            return Ok(StepStatus::Processing);
        }
        self.mmu_version[stage as usize] = self.rsp.param_value as u8;
        if self.mmu_version[stage as usize] != self.supported_version[stage as usize] {
            // saturate: a late duplicate arriving after the budget is
            // spent must not wrap the counter
            self.retries = self.retries.saturating_sub(1);
            if self.retries == 0 {
                return Ok(StepStatus::VersionMismatch);
            }
            self.send_version(stage)?;
        } else {
            // meaningful response, stop link-layer drop-out tracking
            self.dropout.reset();
            self.send_version(stage + 1)?;
        }
        Ok(StepStatus::Processing)
    }

    fn start_seq_step(&mut self) -> Result<StepStatus> {
        match self.scope_state {
            ScopeState::S0Sent => self.process_version_response(0),
            ScopeState::S1Sent => self.process_version_response(1),
            ScopeState::S2Sent => self.process_version_response(2),
            ScopeState::S3Sent => {
                if self.rsp.request.code != RequestMsgCode::Version || self.rsp.request.value != 3 {
                    self.send_version(3)?;
                } else {
                    // the build number is recorded, not verified
                    self.mmu_build = self.rsp.param_value;
                    self.start_writing_init_registers()?;
                }
                Ok(StepStatus::Processing)
            }
            ScopeState::WritingInitRegisters => {
                if self.process_writing_init_register()? {
                    self.send_and_update_filament_sensor()?;
                }
                Ok(StepStatus::Processing)
            }
            ScopeState::FilamentSensorStateSent => {
                self.switch_to_idle();
                // force the first heartbeat immediately; reporting
                // Finished here would end a command that merely survived
                // a fast link recovery
                self.send_query()?;
                Ok(StepStatus::Processing)
            }
            _ => Ok(StepStatus::VersionMismatch),
        }
    }

    fn delayed_restart_wait(&mut self) -> Result<StepStatus> {
        if self.elapsed(self.heartbeat) {
            self.link.purge()?;
            self.restart_handshake()?;
        }
        Ok(StepStatus::Processing)
    }

    fn idle_wait(&mut self) -> Result<StepStatus> {
        if self.scope_state == ScopeState::Ready && self.elapsed(self.heartbeat) {
            self.send_query()?;
            return Ok(StepStatus::Processing);
        }
        Ok(StepStatus::Finished)
    }

    fn command_wait(&mut self) -> Result<StepStatus> {
        if self.elapsed(self.heartbeat) {
            self.send_query()?;
        } else {
            self.check_async_events()?;
        }
        Ok(StepStatus::Processing)
    }

    fn process_command_query_response(&mut self) -> Result<StepStatus> {
        match self.rsp.param_code {
            ResponseMsgParamCode::Processing => {
                self.progress_code = self.rsp.param_value;
                self.error_code = ERROR_OK;
                self.send_and_update_filament_sensor()?;
                Ok(StepStatus::Processing)
            }
            ResponseMsgParamCode::Error => {
                self.progress_code = PROGRESS_WAITING_FOR_USER;
                self.error_code = self.rsp.param_value;
                // the MMU still watches FINDA and the filament sensor
                // while recovering from an error
                self.send_and_update_filament_sensor()?;
                Ok(StepStatus::CommandError)
            }
            ResponseMsgParamCode::Button => {
                self.button_code = Some(self.rsp.param_value as u8);
                self.send_and_update_filament_sensor()?;
                Ok(StepStatus::ButtonPushed)
            }
            ResponseMsgParamCode::Finished => {
                if self.rq.code == self.rsp.request.code && self.rq.value == self.rsp.request.value
                {
                    self.progress_code = PROGRESS_OK;
                    self.error_code = ERROR_OK;
                    self.scope_state = ScopeState::Ready;
                    self.rq = RequestMsg::new(RequestMsgCode::Unknown, 0);
                    Ok(StepStatus::Finished)
                } else {
                    // some other command completed: ours was interrupted
                    Ok(StepStatus::Interrupted)
                }
            }
            _ => Ok(StepStatus::ProtocolError),
        }
    }

    fn command_step(&mut self) -> Result<StepStatus> {
        match self.scope_state {
            ScopeState::CommandSent => match self.rsp.param_code {
                ResponseMsgParamCode::Accepted => {
                    self.progress_code = PROGRESS_OK;
                    self.error_code = ERROR_RUNNING;
                    self.scope_state = ScopeState::Wait;
                    Ok(StepStatus::Processing)
                }
                ResponseMsgParamCode::Rejected => {
                    self.progress_code = PROGRESS_OK;
                    self.error_code = ERROR_PROTOCOL;
                    Ok(StepStatus::CommandRejected)
                }
                _ => Ok(StepStatus::ProtocolError),
            },
            ScopeState::QuerySent => self.process_command_query_response(),
            ScopeState::FilamentSensorStateSent => {
                self.start_reading_8bit_registers()?;
                Ok(StepStatus::Processing)
            }
            ScopeState::Reading8bitRegisters => {
                self.process_read_8bit_register()?;
                Ok(StepStatus::Processing)
            }
            ScopeState::Reading16bitRegisters => {
                self.scope_state = self.process_read_16bit_register(ScopeState::Wait)?;
                Ok(StepStatus::Processing)
            }
            ScopeState::ButtonSent => {
                if self.rsp.param_code == ResponseMsgParamCode::Accepted {
                    self.decrement_retry_attempts();
                }
                self.send_and_update_filament_sensor()?;
                Ok(StepStatus::Processing)
            }
            _ => Ok(StepStatus::ProtocolError),
        }
    }

    fn idle_step(&mut self) -> Result<StepStatus> {
        match self.scope_state {
            ScopeState::QuerySent => self.idle_query_response(),
            ScopeState::Reading8bitRegisters => {
                self.process_read_8bit_register()?;
                Ok(StepStatus::Processing)
            }
            ScopeState::Reading16bitRegisters => {
                self.scope_state = self.process_read_16bit_register(ScopeState::Ready)?;
                if self.scope_state == ScopeState::Ready {
                    // idle cycle complete: hand the channel back
                    Ok(StepStatus::Finished)
                } else {
                    Ok(StepStatus::Processing)
                }
            }
            ScopeState::ButtonSent => {
                if self.rsp.param_code == ResponseMsgParamCode::Accepted {
                    self.decrement_retry_attempts();
                }
                self.start_reading_8bit_registers()?;
                Ok(StepStatus::Processing)
            }
            ScopeState::ReadRegisterSent => {
                if self.rsp.param_code == ResponseMsgParamCode::Accepted {
                    log::info!("mmu register value: {}", self.rsp.param_value);
                    self.register_value = Some(self.rsp.param_value);
                }
                Ok(StepStatus::Finished)
            }
            ScopeState::WriteRegisterSent => Ok(StepStatus::Finished),
            _ => Ok(StepStatus::ProtocolError),
        }
    }

    /// Answer to the idle heartbeat. Normally the MMU reports a finished
    /// reset (`X0 F`), but after a communication drop-out it may still be
    /// executing a command we issued earlier; in that case the Command
    /// scope resumes without restarting the link.
    fn idle_query_response(&mut self) -> Result<StepStatus> {
        match self.rsp.request.code {
            RequestMsgCode::Cut
            | RequestMsgCode::Eject
            | RequestMsgCode::Load
            | RequestMsgCode::Tool
            | RequestMsgCode::Unload
            | RequestMsgCode::Home => {
                if self.rsp.param_code != ResponseMsgParamCode::Finished {
                    self.scope = Scope::Command;
                    self.rq = self.rsp.request;
                    return self.process_command_query_response();
                }
            }
            RequestMsgCode::Reset => {
                // a reset response stays in Idle, but errors and buttons
                // must still propagate
                match self.rsp.param_code {
                    ResponseMsgParamCode::Button => {
                        self.button_code = Some(self.rsp.param_value as u8);
                        self.start_reading_8bit_registers()?;
                        return Ok(StepStatus::ButtonPushed);
                    }
                    ResponseMsgParamCode::Finished => {
                        if self.rq.code != RequestMsgCode::Unknown {
                            // reset arrived while a command was active
                            self.scope_state = ScopeState::Ready;
                            return Ok(StepStatus::Interrupted);
                        }
                        self.progress_code = self.rsp.param_value;
                        self.error_code = ERROR_OK;
                    }
                    ResponseMsgParamCode::Processing => {
                        // manual operation progress after an MMU restart
                        self.progress_code = self.rsp.param_value;
                        self.error_code = ERROR_OK;
                    }
                    _ => {
                        self.progress_code = PROGRESS_WAITING_FOR_USER;
                        self.error_code = self.rsp.param_value;
                        self.start_reading_8bit_registers()?;
                        return Ok(StepStatus::CommandError);
                    }
                }
            }
            _ => return Ok(StepStatus::ProtocolError),
        }
        self.start_reading_8bit_registers()?;
        Ok(StepStatus::Processing)
    }

    // --- planned requests -------------------------------------------------

    fn plan_request(&mut self, rq: RequestMsg) -> Result<()> {
        self.planned_rq = rq;
        if !self.expects_response() {
            self.activate_planned_request()?;
        }
        Ok(())
    }

    fn activate_planned_request(&mut self) -> Result<bool> {
        match self.planned_rq.code {
            RequestMsgCode::Unknown => return Ok(false),
            RequestMsgCode::Button | RequestMsgCode::Read | RequestMsgCode::Write => {}
            _ => {
                // a queued command waits until the active one finishes
                if self.scope == Scope::Command && self.rq.code != RequestMsgCode::Unknown {
                    return Ok(false);
                }
            }
        }
        let planned = std::mem::replace(
            &mut self.planned_rq,
            RequestMsg::new(RequestMsgCode::Unknown, 0),
        );
        match planned.code {
            RequestMsgCode::Unknown => Ok(false),
            // buttons and register accesses ride on the current scope
            RequestMsgCode::Button => {
                self.send_button(planned.value)?;
                Ok(true)
            }
            RequestMsgCode::Read => {
                self.send_read_register(planned.value, ScopeState::ReadRegisterSent)?;
                Ok(true)
            }
            RequestMsgCode::Write => {
                self.send_write_register(
                    planned.value,
                    planned.value2,
                    ScopeState::WriteRegisterSent,
                )?;
                Ok(true)
            }
            _ => {
                self.scope = Scope::Command;
                self.rq = planned;
                self.command_restart()?;
                Ok(true)
            }
        }
    }

    fn command_restart(&mut self) -> Result<()> {
        self.scope_state = ScopeState::CommandSent;
        self.send_msg(self.rq)
    }

    fn switch_to_idle(&mut self) {
        self.scope = Scope::Idle;
        self.scope_state = ScopeState::Ready;
    }

    // --- recovery ---------------------------------------------------------

    fn suppress_short_dropouts(&mut self, what: &str, cause: StepStatus) -> StepStatus {
        if self.dropout.record(cause) {
            log::error!("mmu {}", what);
            self.dropout.reset();
            self.dropout.initial_cause()
        } else {
            StepStatus::Processing
        }
    }

    fn handle_communication_timeout(&mut self) -> Result<StepStatus> {
        self.link.purge()?;
        self.restart_handshake()?;
        Ok(self.suppress_short_dropouts("communication timeout", StepStatus::CommunicationTimeout))
    }

    fn handle_protocol_error(&mut self) -> Result<StepStatus> {
        self.link.purge()?;
        // wait out a heartbeat before restarting; the peer may be
        // rebooting and hammering it with handshakes only makes it worse
        self.scope = Scope::DelayedRestart;
        self.scope_state = ScopeState::RecoveringProtocolError;
        Ok(self.suppress_short_dropouts("protocol error", StepStatus::ProtocolError))
    }

    fn decrement_retry_attempts(&mut self) {
        if self.in_auto_retry && self.retry_attempts > 0 {
            self.retry_attempts -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::mock::ScriptedLink;

    const T: RequestMsgCode = RequestMsgCode::Tool;

    fn respond(link: &ScriptedLink, code: RequestMsgCode, value: u8, param: ResponseMsgParamCode, pv: u16) {
        link.push_response(ResponseMsg::new(
            RequestMsg::new(code, value),
            param,
            pv,
        ));
    }

    fn accepted(link: &ScriptedLink, rq: RequestMsg) {
        link.push_response(ResponseMsg::new(rq, ResponseMsgParamCode::Accepted, 0));
    }

    fn started() -> (ProtocolLogic<ScriptedLink>, ScriptedLink, Instant) {
        let _ = env_logger::builder().is_test(true).try_init();
        let link = ScriptedLink::new();
        let mut logic = ProtocolLogic::new(link.clone(), &MmuConfig::default());
        let t0 = Instant::now();
        logic.start(t0).unwrap();
        (logic, link, t0)
    }

    /// Queue responses for the 3 + 2 register battery reads
    fn respond_register_battery(link: &ScriptedLink) {
        for (i, addr) in REGS8_ADDRS.iter().enumerate() {
            respond(link, RequestMsgCode::Read, *addr, ResponseMsgParamCode::Accepted, i as u16 + 1);
        }
        for (i, addr) in REGS16_ADDRS.iter().enumerate() {
            respond(link, RequestMsgCode::Read, *addr, ResponseMsgParamCode::Accepted, 100 + i as u16);
        }
    }

    /// Drive a freshly started logic through the handshake into Idle,
    /// ending right after a complete idle cycle
    fn reach_idle(logic: &mut ProtocolLogic<ScriptedLink>, link: &ScriptedLink, t: Instant) {
        // version stages, init registers, filament sensor
        for stage in 0..4u8 {
            respond(link, RequestMsgCode::Version, stage, ResponseMsgParamCode::Accepted,
                if stage < 3 { u16::from(MmuConfig::default().supported_version[stage as usize]) } else { 370 });
        }
        for addr in INIT_REGS_ADDRS {
            accepted(link, RequestMsg::write(addr, 0));
        }
        accepted(link, RequestMsg::new(RequestMsgCode::FilamentSensor, 0));
        // first heartbeat: the MMU reports a finished reset
        respond(link, RequestMsgCode::Reset, 0, ResponseMsgParamCode::Finished, 0);
        respond_register_battery(link);

        let mut last = StepStatus::Processing;
        for _ in 0..20 {
            last = logic.step(t).unwrap();
            if link.pending() == 0 && last == StepStatus::Finished {
                break;
            }
        }
        assert_eq!(last, StepStatus::Finished);
    }

    #[test]
    fn test_dropout_filter_suppresses_short_runs() {
        let mut filter = DropOutFilter::new(3);
        assert!(!filter.record(StepStatus::CommunicationTimeout));
        assert!(!filter.record(StepStatus::ProtocolError));
        assert!(filter.record(StepStatus::ProtocolError));
        // the first recorded cause of the run wins
        assert_eq!(filter.initial_cause(), StepStatus::CommunicationTimeout);
        filter.reset();
        assert!(!filter.record(StepStatus::ProtocolError));
    }

    #[test]
    fn test_dropout_filter_zero_budget_reports_immediately() {
        let mut filter = DropOutFilter::new(0);
        assert!(filter.record(StepStatus::CommunicationTimeout));
        assert_eq!(filter.initial_cause(), StepStatus::CommunicationTimeout);
        // and stays armed without ever underflowing
        assert!(filter.record(StepStatus::ProtocolError));
    }

    #[test]
    fn test_handshake_reaches_idle() {
        let (mut logic, link, t0) = started();
        assert_eq!(link.take_sent(), vec![RequestMsg::new(RequestMsgCode::Version, 0)]);

        reach_idle(&mut logic, &link, t0);
        assert_eq!(logic.fw_version(), [3, 0, 3]);
        assert_eq!(logic.fw_build(), 370);
        assert_eq!(logic.regs8(), [1, 2, 3]);
        assert_eq!(logic.regs16(), [100, 101]);
        assert_eq!(logic.command_in_progress(), None);

        let sent = link.take_sent();
        // S1..S3, two init writes, fsensor, Q0, five register reads
        assert_eq!(sent.len(), 12);
        assert_eq!(sent[3].code, RequestMsgCode::Write);
        assert_eq!(sent[5].code, RequestMsgCode::FilamentSensor);
        assert_eq!(sent[6].code, RequestMsgCode::Query);
    }

    #[test]
    fn test_version_mismatch_after_retries() {
        let (mut logic, link, t0) = started();
        let mut statuses = Vec::new();
        for _ in 0..3 {
            respond(&link, RequestMsgCode::Version, 0, ResponseMsgParamCode::Accepted, 2);
            statuses.push(logic.step(t0).unwrap());
        }
        assert_eq!(
            statuses,
            vec![StepStatus::Processing, StepStatus::Processing, StepStatus::VersionMismatch]
        );
    }

    #[test]
    fn test_late_duplicate_after_version_mismatch_is_harmless() {
        let (mut logic, link, t0) = started();
        for _ in 0..3 {
            respond(&link, RequestMsgCode::Version, 0, ResponseMsgParamCode::Accepted, 2);
            logic.step(t0).unwrap();
        }
        // a late duplicate of the mismatched response is valid wire
        // traffic and must not corrupt the spent retry budget
        respond(&link, RequestMsgCode::Version, 0, ResponseMsgParamCode::Accepted, 2);
        assert_eq!(logic.step(t0).unwrap(), StepStatus::VersionMismatch);
    }

    #[test]
    fn test_zero_version_retries_reports_first_mismatch() {
        let link = ScriptedLink::new();
        let cfg = MmuConfig {
            version_retries: 0,
            ..MmuConfig::default()
        };
        let mut logic = ProtocolLogic::new(link.clone(), &cfg);
        let t0 = Instant::now();
        logic.start(t0).unwrap();

        respond(&link, RequestMsgCode::Version, 0, ResponseMsgParamCode::Accepted, 2);
        assert_eq!(logic.step(t0).unwrap(), StepStatus::VersionMismatch);
    }

    #[test]
    fn test_command_accepted_processing_finished() {
        let (mut logic, link, t0) = started();
        reach_idle(&mut logic, &link, t0);
        link.take_sent();

        logic.tool_change(1).unwrap();
        assert_eq!(link.take_sent(), vec![RequestMsg::new(T, 1)]);

        accepted(&link, RequestMsg::new(T, 1));
        assert_eq!(logic.step(t0).unwrap(), StepStatus::Processing);
        assert_eq!(logic.error_code(), ERROR_RUNNING);
        assert_eq!(logic.command_in_progress(), Some(T));

        // heartbeat elapses, a progress poll runs
        let t1 = t0 + Duration::from_millis(301);
        assert_eq!(logic.step(t1).unwrap(), StepStatus::Processing); // sends Q0
        respond(&link, T, 1, ResponseMsgParamCode::Processing, 5);
        assert_eq!(logic.step(t1).unwrap(), StepStatus::Processing);
        assert_eq!(logic.progress_code(), 5);

        // fsensor report + register battery follow each progress poll
        accepted(&link, RequestMsg::new(RequestMsgCode::FilamentSensor, 0));
        respond_register_battery(&link);
        while link.pending() > 0 {
            assert_eq!(logic.step(t1).unwrap(), StepStatus::Processing);
        }

        // next heartbeat: finished
        let t2 = t1 + Duration::from_millis(301);
        assert_eq!(logic.step(t2).unwrap(), StepStatus::Processing); // sends Q0
        respond(&link, T, 1, ResponseMsgParamCode::Finished, 0);
        assert_eq!(logic.step(t2).unwrap(), StepStatus::Finished);
        assert_eq!(logic.command_in_progress(), None);
        assert_eq!(logic.error_code(), ERROR_OK);
    }

    #[test]
    fn test_mismatched_finished_is_interrupted() {
        let (mut logic, link, t0) = started();
        reach_idle(&mut logic, &link, t0);

        logic.tool_change(1).unwrap();
        accepted(&link, RequestMsg::new(T, 1));
        assert_eq!(logic.step(t0).unwrap(), StepStatus::Processing);

        let t1 = t0 + Duration::from_millis(301);
        assert_eq!(logic.step(t1).unwrap(), StepStatus::Processing); // sends Q0
        // a different command finished: the MMU restarted underneath us
        respond(&link, RequestMsgCode::Unload, 0, ResponseMsgParamCode::Finished, 0);
        assert_eq!(logic.step(t1).unwrap(), StepStatus::Interrupted);
    }

    #[test]
    fn test_command_rejected_is_resent() {
        let (mut logic, link, t0) = started();
        reach_idle(&mut logic, &link, t0);
        link.take_sent();

        logic.tool_change(2).unwrap();
        respond(&link, T, 2, ResponseMsgParamCode::Rejected, 0);
        assert_eq!(logic.step(t0).unwrap(), StepStatus::CommandRejected);
        // the command goes out again immediately
        assert_eq!(link.take_sent(), vec![RequestMsg::new(T, 2), RequestMsg::new(T, 2)]);
        assert_eq!(logic.error_code(), ERROR_PROTOCOL);
    }

    #[test]
    fn test_button_during_command() {
        let (mut logic, link, t0) = started();
        reach_idle(&mut logic, &link, t0);

        logic.tool_change(1).unwrap();
        accepted(&link, RequestMsg::new(T, 1));
        assert_eq!(logic.step(t0).unwrap(), StepStatus::Processing);

        let t1 = t0 + Duration::from_millis(301);
        assert_eq!(logic.step(t1).unwrap(), StepStatus::Processing); // sends Q0
        respond(&link, T, 1, ResponseMsgParamCode::Button, 3);
        assert_eq!(logic.step(t1).unwrap(), StepStatus::ButtonPushed);
        assert_eq!(logic.take_button(), Some(3));
        assert_eq!(logic.take_button(), None);
    }

    #[test]
    fn test_command_error_reports_code() {
        let (mut logic, link, t0) = started();
        reach_idle(&mut logic, &link, t0);

        logic.tool_change(1).unwrap();
        accepted(&link, RequestMsg::new(T, 1));
        assert_eq!(logic.step(t0).unwrap(), StepStatus::Processing);

        let t1 = t0 + Duration::from_millis(301);
        assert_eq!(logic.step(t1).unwrap(), StepStatus::Processing); // sends Q0
        respond(&link, T, 1, ResponseMsgParamCode::Error, 0x8123);
        assert_eq!(logic.step(t1).unwrap(), StepStatus::CommandError);
        assert_eq!(logic.error_code(), 0x8123);
        assert_eq!(logic.progress_code(), PROGRESS_WAITING_FOR_USER);
    }

    #[test]
    fn test_idle_recovers_running_command() {
        let (mut logic, link, t0) = started();
        reach_idle(&mut logic, &link, t0);

        // heartbeat elapses while idle
        let t1 = t0 + Duration::from_millis(301);
        assert_eq!(logic.step(t1).unwrap(), StepStatus::Processing); // sends Q0
        // the MMU reports a command still in progress: the link dropped
        // and recovered while T2 was running
        respond(&link, T, 2, ResponseMsgParamCode::Processing, 7);
        assert_eq!(logic.step(t1).unwrap(), StepStatus::Processing);
        assert_eq!(logic.command_in_progress(), Some(T));
        assert_eq!(logic.progress_code(), 7);
    }

    #[test]
    fn test_communication_timeout_suppressed_then_reported() {
        let (mut logic, link, t0) = started();

        let mut statuses = Vec::new();
        let mut t = t0;
        for _ in 0..3 {
            t += Duration::from_millis(2001);
            statuses.push(logic.step(t).unwrap());
        }
        assert_eq!(
            statuses,
            vec![StepStatus::Processing, StepStatus::Processing, StepStatus::CommunicationTimeout]
        );
        // initial probe plus one handshake restart per timeout
        let sent = link.take_sent();
        assert_eq!(sent.len(), 4);
        assert!(sent.iter().all(|rq| *rq == RequestMsg::new(RequestMsgCode::Version, 0)));
        assert_eq!(link.purge_count(), 3);
    }

    #[test]
    fn test_protocol_error_enters_delayed_restart() {
        let (mut logic, link, t0) = started();

        link.push_malformed();
        assert_eq!(logic.step(t0).unwrap(), StepStatus::Processing); // suppressed
        assert_eq!(link.purge_count(), 1);

        // no handshake traffic until a full heartbeat of silence
        assert_eq!(logic.step(t0 + Duration::from_millis(100)).unwrap(), StepStatus::Processing);
        assert_eq!(link.take_sent().len(), 1); // only the initial S0

        assert_eq!(logic.step(t0 + Duration::from_millis(301)).unwrap(), StepStatus::Processing);
        assert_eq!(link.take_sent(), vec![RequestMsg::new(RequestMsgCode::Version, 0)]);
        assert_eq!(link.purge_count(), 2);
    }

    #[test]
    fn test_planned_request_waits_for_free_channel() {
        let (mut logic, link, t0) = started();
        reach_idle(&mut logic, &link, t0);
        link.take_sent();

        logic.tool_change(1).unwrap();
        assert_eq!(link.take_sent(), vec![RequestMsg::new(T, 1)]);
        // a second command queues instead of going on the wire
        logic.unload_filament().unwrap();
        assert_eq!(link.take_sent(), vec![]);

        accepted(&link, RequestMsg::new(T, 1));
        assert_eq!(logic.step(t0).unwrap(), StepStatus::Processing);

        let t1 = t0 + Duration::from_millis(301);
        assert_eq!(logic.step(t1).unwrap(), StepStatus::Processing); // sends Q0
        respond(&link, T, 1, ResponseMsgParamCode::Finished, 0);
        // the finish immediately activates the queued unload
        assert_eq!(logic.step(t1).unwrap(), StepStatus::Processing);
        assert_eq!(logic.command_in_progress(), Some(RequestMsgCode::Unload));
        let sent = link.take_sent();
        assert_eq!(*sent.last().unwrap(), RequestMsg::new(RequestMsgCode::Unload, 0));
    }

    #[test]
    fn test_filament_sensor_change_reported_between_heartbeats() {
        let (mut logic, link, t0) = started();
        reach_idle(&mut logic, &link, t0);

        logic.tool_change(1).unwrap();
        accepted(&link, RequestMsg::new(T, 1));
        assert_eq!(logic.step(t0).unwrap(), StepStatus::Processing);
        link.take_sent();

        // mid-wait, before the next heartbeat
        logic.set_filament_state(1);
        assert_eq!(logic.step(t0 + Duration::from_millis(10)).unwrap(), StepStatus::Processing);
        assert_eq!(
            link.take_sent(),
            vec![RequestMsg::new(RequestMsgCode::FilamentSensor, 1)]
        );
    }

    #[test]
    fn test_printer_error_overrides_status() {
        let (mut logic, link, t0) = started();
        reach_idle(&mut logic, &link, t0);

        logic.set_printer_error(0x1234);
        assert_eq!(logic.step(t0).unwrap(), StepStatus::PrinterError);
        logic.clear_printer_error();
        assert_eq!(logic.step(t0).unwrap(), StepStatus::Finished);
    }

    #[test]
    fn test_explicit_register_read_in_idle() {
        let (mut logic, link, t0) = started();
        reach_idle(&mut logic, &link, t0);
        link.take_sent();

        logic.read_register(registers::PULLEY_POSITION).unwrap();
        assert_eq!(
            link.take_sent(),
            vec![RequestMsg::new(RequestMsgCode::Read, registers::PULLEY_POSITION)]
        );
        respond(
            &link,
            RequestMsgCode::Read,
            registers::PULLEY_POSITION,
            ResponseMsgParamCode::Accepted,
            42,
        );
        assert_eq!(logic.step(t0).unwrap(), StepStatus::Finished);
        assert_eq!(logic.take_register_value(), Some(42));
    }

    #[test]
    fn test_idle_reset_button_propagates() {
        let (mut logic, link, t0) = started();
        reach_idle(&mut logic, &link, t0);

        let t1 = t0 + Duration::from_millis(301);
        assert_eq!(logic.step(t1).unwrap(), StepStatus::Processing); // sends Q0
        respond(&link, RequestMsgCode::Reset, 0, ResponseMsgParamCode::Button, 2);
        assert_eq!(logic.step(t1).unwrap(), StepStatus::ButtonPushed);
        assert_eq!(logic.take_button(), Some(2));
        // the register battery still follows
        respond_register_battery(&link);
        while link.pending() > 0 {
            logic.step(t1).unwrap();
        }
    }
}
