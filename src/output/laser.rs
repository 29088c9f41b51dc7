use tracing::{debug, info, warn};

use super::protocol::{pack_pattern, AckReader, ActuatorCommand, DeactivateCode, PATTERN_CHANNELS};
use super::transport::Transport;
use crate::config::validate_duration_ms;
use crate::error::{ConfigError, TransportError};
use crate::utils::log::CommandLog;

/// What the controller believes the device is doing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActuatorState {
    pub enabled: bool,
    pub active: bool,
    pub pulse_duration_ms: u32,
    /// Tick of the most recent activate or pattern trigger.
    pub last_trigger_time: Option<u64>,
    pub acks_received: u64,
    pub write_failures: u64,
}

/// Serial link to the stimulation laser.
///
/// Without a transport every operation succeeds without doing anything, so a
/// session can run dry on a machine with no device attached.
pub struct ActuatorLink {
    transport: Option<Box<dyn Transport>>,
    deactivate_code: DeactivateCode,
    state: ActuatorState,
    acks: AckReader,
    command_log: Option<CommandLog>,
    clock_tick: u64,
}

impl ActuatorLink {
    pub fn new(transport: Option<Box<dyn Transport>>, deactivate_code: DeactivateCode) -> Self {
        match &transport {
            Some(t) => info!("actuator link on {}", t.describe()),
            None => info!("no actuator transport configured, running dry"),
        }
        Self {
            transport,
            deactivate_code,
            state: ActuatorState::default(),
            acks: AckReader::new(),
            command_log: None,
            clock_tick: 0,
        }
    }

    pub fn dry() -> Self {
        Self::new(None, DeactivateCode::default())
    }

    pub fn with_command_log(mut self, log: CommandLog) -> Self {
        self.command_log = Some(log);
        self
    }

    pub fn is_dry(&self) -> bool {
        self.transport.is_none()
    }

    pub fn state(&self) -> &ActuatorState {
        &self.state
    }

    pub fn is_active(&self) -> bool {
        self.state.active
    }

    /// Latches the pulse duration locally and on the device.
    ///
    /// Rejects negative or fractional durations. A failed write is logged and
    /// does not fail the call.
    pub fn configure_duration(&mut self, ms: f64) -> Result<(), ConfigError> {
        let ms = validate_duration_ms(ms)?;
        self.state.pulse_duration_ms = ms;
        if let Err(e) = self.send(ActuatorCommand::SetDuration(ms)) {
            warn!("failed to send pulse duration {} ms: {}", ms, e);
        }
        Ok(())
    }

    pub fn enable(&mut self) -> Result<(), TransportError> {
        self.send(ActuatorCommand::Enable)?;
        self.state.enabled = true;
        Ok(())
    }

    pub fn disable(&mut self) -> Result<(), TransportError> {
        self.send(ActuatorCommand::Disable)?;
        self.state.enabled = false;
        Ok(())
    }

    pub fn activate(&mut self, now: u64) -> Result<(), TransportError> {
        self.clock_tick = now;
        self.send(ActuatorCommand::Activate)?;
        self.state.active = true;
        self.state.last_trigger_time = Some(now);
        Ok(())
    }

    /// Switches the actuator off. On failure the link still counts as active.
    pub fn deactivate(&mut self) -> Result<(), TransportError> {
        self.send(ActuatorCommand::Deactivate(self.deactivate_code))?;
        self.state.active = false;
        Ok(())
    }

    /// Triggers the channels set in `flags`. Only the first 16 flags are used.
    pub fn send_pattern(&mut self, flags: &[bool], now: u64) -> Result<(), TransportError> {
        if flags.len() > PATTERN_CHANNELS {
            warn!(
                "pattern has {} channels, sending the first {}",
                flags.len(),
                PATTERN_CHANNELS
            );
        }
        self.clock_tick = now;
        self.send(ActuatorCommand::Pattern(pack_pattern(flags)))?;
        self.state.active = true;
        self.state.last_trigger_time = Some(now);
        Ok(())
    }

    /// Sets the tick stamped on command log rows for commands without one.
    pub fn set_tick(&mut self, now: u64) {
        self.clock_tick = now;
    }

    /// Logs any acknowledgment lines the device has sent. Never fails.
    pub fn drain_acks(&mut self) {
        let Some(transport) = self.transport.as_mut() else {
            return;
        };
        let bytes = match transport.read_available() {
            Ok(bytes) => bytes,
            Err(e) => {
                debug!("no acknowledgment: {}", e);
                return;
            }
        };
        for line in self.acks.push(&bytes) {
            match line {
                Ok(ack) => {
                    self.state.acks_received += 1;
                    debug!("actuator ack: {}", ack);
                }
                Err(violation) => warn!("ignoring actuator reply: {}", violation),
            }
        }
    }

    fn send(&mut self, command: ActuatorCommand) -> Result<(), TransportError> {
        let Some(transport) = self.transport.as_mut() else {
            debug!("dry run: {:?}", command);
            self.record(&command, true);
            return Ok(());
        };

        let result = transport.write_bytes(&command.encode());
        match &result {
            Ok(()) => debug!("sent {:?}", command),
            Err(_) => self.state.write_failures += 1,
        }
        self.record(&command, result.is_ok());
        self.drain_acks();
        result
    }

    fn record(&mut self, command: &ActuatorCommand, delivered: bool) {
        if let Some(log) = self.command_log.as_mut() {
            if let Err(e) = log.record(self.clock_tick, command, delivered) {
                warn!("command log write failed, disabling it: {}", e);
                self.command_log = None;
            }
        }
    }
}

impl Drop for ActuatorLink {
    fn drop(&mut self) {
        if self.state.active {
            warn!("actuator link dropped while active, switching off");
            if let Err(e) = self.deactivate() {
                warn!("final deactivate failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::transport::MemoryTransport;

    fn linked() -> (ActuatorLink, MemoryTransport) {
        let device = MemoryTransport::new();
        let link = ActuatorLink::new(Some(Box::new(device.clone())), DeactivateCode::UpperA);
        (link, device)
    }

    #[test]
    fn test_dry_mode_is_a_no_op() {
        let mut link = ActuatorLink::dry();
        assert!(link.is_dry());
        link.configure_duration(250.0).unwrap();
        link.enable().unwrap();
        link.activate(10).unwrap();
        link.send_pattern(&[true; 20], 11).unwrap();
        link.deactivate().unwrap();
        link.disable().unwrap();
        link.drain_acks();
        assert!(!link.is_active());
        assert_eq!(link.state().pulse_duration_ms, 250);
    }

    #[test]
    fn test_commands_reach_the_device() {
        let (mut link, device) = linked();
        link.configure_duration(500.0).unwrap();
        link.enable().unwrap();
        link.activate(42).unwrap();
        assert!(link.is_active());
        assert_eq!(link.state().last_trigger_time, Some(42));
        link.deactivate().unwrap();
        link.disable().unwrap();
        assert_eq!(
            device.written(),
            vec![
                b"d500".to_vec(),
                b"e".to_vec(),
                b"a".to_vec(),
                b"A".to_vec(),
                b"E".to_vec()
            ]
        );
    }

    #[test]
    fn test_alias_deactivate_code() {
        let device = MemoryTransport::new();
        let mut link = ActuatorLink::new(Some(Box::new(device.clone())), DeactivateCode::LowerB);
        link.activate(0).unwrap();
        link.deactivate().unwrap();
        assert_eq!(device.written_bytes(), b"ab".to_vec());
    }

    #[test]
    fn test_invalid_duration_is_rejected_before_sending() {
        let (mut link, device) = linked();
        assert!(link.configure_duration(-1.0).is_err());
        assert!(link.configure_duration(12.5).is_err());
        assert!(device.written().is_empty());
    }

    #[test]
    fn test_failed_deactivate_keeps_link_active() {
        let (mut link, device) = linked();
        link.activate(0).unwrap();
        device.set_fail_writes(true);
        assert!(link.deactivate().is_err());
        assert!(link.is_active());
        assert_eq!(link.state().write_failures, 1);
        device.set_fail_writes(false);
        link.deactivate().unwrap();
        assert!(!link.is_active());
    }

    #[test]
    fn test_acks_are_counted() {
        let (mut link, device) = linked();
        device.push_reply(b"OK\nOK\n\xff\n");
        link.enable().unwrap();
        assert_eq!(link.state().acks_received, 2);
    }

    #[test]
    fn test_drop_switches_active_actuator_off() {
        let (mut link, device) = linked();
        link.send_pattern(&[false, true], 5).unwrap();
        drop(link);
        assert_eq!(device.written(), vec![vec![b'p', 0x40, 0x00], b"A".to_vec()]);
    }
}
