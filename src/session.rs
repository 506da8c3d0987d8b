/*!
 # Device sessions

 A [`DeviceSession`] owns one [`Transport`] and sends commands through it
 strictly one at a time, leaving a pacing delay between writes. Bulbs drop
 commands that arrive back to back.
*/

use std::time::Duration;

use tokio::time::{self, Instant};
use tracing::{debug, info, instrument, trace, warn};

use crate::color::Rgb;
use crate::command::Command;
use crate::config::SessionConfig;
use crate::mapping::ChannelMapping;
use crate::transport::Transport;
use crate::{Error, Result};

/// A command plus how many times to send it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub command: Command,
    /// Number of sends, at least one
    pub repeat: u8,
}

impl Step {
    pub fn once(command: Command) -> Self {
        Self { command, repeat: 1 }
    }

    /// Sends `command` `repeat` times; resending color is common for reliability
    pub fn repeated(command: Command, repeat: u8) -> Self {
        Self {
            command,
            repeat: repeat.max(1),
        }
    }
}

impl From<Command> for Step {
    fn from(command: Command) -> Self {
        Self::once(command)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ColorSetting {
    Rgb(Rgb),
    Temperature(u16),
}

/// Desired device state, turned into steps in the canonical order:
/// power, then brightness, then color or color temperature.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Intent {
    power: Option<bool>,
    brightness: Option<i32>,
    color: Option<ColorSetting>,
    color_repeat: u8,
}

impl Intent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn power(mut self, on: bool) -> Self {
        self.power = Some(on);
        self
    }

    pub fn brightness(mut self, percent: i32) -> Self {
        self.brightness = Some(percent);
        self
    }

    /// Sets an RGB color, replacing any color temperature
    pub fn color(mut self, rgb: Rgb) -> Self {
        self.color = Some(ColorSetting::Rgb(rgb));
        self
    }

    /// Sets a color temperature, replacing any RGB color
    pub fn color_temperature(mut self, kelvin: u16) -> Self {
        self.color = Some(ColorSetting::Temperature(kelvin));
        self
    }

    /// How many times the color step is sent
    pub fn color_repeat(mut self, repeat: u8) -> Self {
        self.color_repeat = repeat;
        self
    }

    pub fn into_steps(self) -> Vec<Step> {
        let mut steps = Vec::with_capacity(3);
        match self.power {
            Some(true) => steps.push(Step::once(Command::PowerOn)),
            Some(false) => steps.push(Step::once(Command::PowerOff)),
            None => {}
        }
        if let Some(percent) = self.brightness {
            steps.push(Step::once(Command::Brightness(percent)));
        }
        let color = match self.color {
            Some(ColorSetting::Rgb(rgb)) => Some(Command::Color(rgb)),
            Some(ColorSetting::Temperature(kelvin)) => Some(Command::ColorTemperature(kelvin)),
            None => None,
        };
        if let Some(command) = color {
            steps.push(Step::repeated(command, self.color_repeat));
        }
        steps
    }
}

/// Paced, sequential command delivery over one transport
pub struct DeviceSession<T: Transport> {
    transport: T,
    config: SessionConfig,
    last_write: Option<Instant>,
}

impl<T: Transport> DeviceSession<T> {
    pub fn new(transport: T) -> Self {
        Self::with_config(transport, SessionConfig::default())
    }

    pub fn with_config(transport: T, config: SessionConfig) -> Self {
        Self {
            transport,
            config,
            last_write: None,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Connects the underlying transport
    pub async fn open(&mut self, timeout: Duration) -> Result<()> {
        self.transport.connect(timeout).await
    }

    /// Disconnects the underlying transport
    pub async fn close(&mut self) -> Result<()> {
        self.transport.disconnect().await
    }

    /// Disconnects and hands back `result`; a failed disconnect is only logged
    pub async fn close_with<R, E>(
        &mut self,
        result: std::result::Result<R, E>,
    ) -> std::result::Result<R, E> {
        if let Err(e) = self.close().await {
            warn!("Failed to close session: {}", e);
        }
        result
    }

    /// Sends `steps` in order, stopping at the first failure.
    ///
    /// Nothing is rolled back on failure; the device state is then unknown and
    /// the caller should re-apply. Applying the same steps twice is harmless.
    #[instrument(skip(self, steps, mapping), fields(device = %self.transport.device(), steps = steps.len()))]
    pub async fn apply(&mut self, steps: &[Step], mapping: ChannelMapping) -> Result<()> {
        match self.config.deadline {
            Some(deadline) => time::timeout(deadline, self.run(steps, mapping))
                .await
                .map_err(|_| {
                    warn!("Session deadline of {:?} expired", deadline);
                    Error::Timeout(deadline)
                })?,
            None => self.run(steps, mapping).await,
        }
    }

    async fn run(&mut self, steps: &[Step], mapping: ChannelMapping) -> Result<()> {
        for step in steps {
            for attempt in 0..step.repeat.max(1) {
                self.wait_for_pacing().await;
                trace!("Sending {} ({}/{})", step.command, attempt + 1, step.repeat);

                let result = self.transport.send(&step.command, mapping).await;
                self.last_write = Some(Instant::now());
                result.inspect_err(|e| warn!("Stopping after failed send: {}", e))?;
            }
        }
        info!("Applied {} step(s)", steps.len());
        Ok(())
    }

    /// Sends a raw opcode and payload, paced like any other write
    #[instrument(skip(self, payload))]
    pub async fn send_raw(&mut self, opcode: u8, payload: &[u8]) -> Result<()> {
        self.wait_for_pacing().await;
        let result = self.transport.send_raw(opcode, payload).await;
        self.last_write = Some(Instant::now());
        result
    }

    async fn wait_for_pacing(&self) {
        if let Some(last) = self.last_write {
            let elapsed = last.elapsed();
            if elapsed < self.config.pacing {
                let wait_time = self.config.pacing - elapsed;
                debug!("Pacing: waiting {:?} before next command", wait_time);
                time::sleep(wait_time).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::color::Channel;
    use crate::transport::testing::{RecordingTransport, Sent};

    async fn session(config: SessionConfig) -> (DeviceSession<RecordingTransport>, RecordingTransport) {
        let transport = RecordingTransport::new();
        let probe = transport.clone();
        let mut session = DeviceSession::with_config(transport, config);
        session.open(Duration::from_secs(1)).await.unwrap();
        (session, probe)
    }

    fn paced(ms: u64) -> SessionConfig {
        SessionConfig {
            pacing: Duration::from_millis(ms),
            deadline: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn sends_in_order_with_pacing() {
        let (mut session, probe) = session(paced(500)).await;
        let steps = Intent::new()
            .power(true)
            .brightness(100)
            .color(Rgb::new(0, 255, 0))
            .into_steps();

        session
            .apply(&steps, ChannelMapping::identity())
            .await
            .unwrap();

        let identity = ChannelMapping::identity();
        assert_eq!(
            probe.sent(),
            vec![
                Sent::Command(Command::PowerOn, identity),
                Sent::Command(Command::Brightness(100), identity),
                Sent::Command(Command::Color(Rgb::new(0, 255, 0)), identity),
            ]
        );
        let times = probe.times();
        for pair in times.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(500));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn intent_order_is_canonical() {
        let steps = Intent::new()
            .color_temperature(2700)
            .brightness(40)
            .power(true)
            .into_steps();
        let commands: Vec<Command> = steps.iter().map(|s| s.command).collect();
        assert_eq!(
            commands,
            vec![
                Command::PowerOn,
                Command::Brightness(40),
                Command::ColorTemperature(2700)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn repeats_are_sent_and_paced() {
        let (mut session, probe) = session(paced(200)).await;
        let steps = Intent::new().color(Rgb::RED).color_repeat(2).into_steps();

        session
            .apply(&steps, ChannelMapping::identity())
            .await
            .unwrap();
        // Re-applying is fine and is not deduplicated
        session
            .apply(&steps, ChannelMapping::identity())
            .await
            .unwrap();

        assert_eq!(probe.sent().len(), 4);
        let times = probe.times();
        assert!(times[1] - times[0] >= Duration::from_millis(200));
        assert!(times[2] - times[1] >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn stops_at_first_failure() {
        let mut transport = RecordingTransport::new();
        transport.fail_at = Some(1);
        let probe = transport.clone();
        let mut session = DeviceSession::with_config(transport, paced(10));
        session.open(Duration::from_secs(1)).await.unwrap();

        let steps = [
            Step::once(Command::PowerOn),
            Step::once(Command::Brightness(50)),
            Step::once(Command::Color(Rgb::BLUE)),
        ];
        let result = session.apply(&steps, ChannelMapping::identity()).await;

        assert!(matches!(result, Err(Error::Send(_))));
        assert_eq!(probe.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_expires() {
        let config = SessionConfig {
            pacing: Duration::from_secs(1),
            deadline: Some(Duration::from_millis(1500)),
        };
        let (mut session, probe) = session(config).await;
        let steps = [Command::PowerOn, Command::Brightness(10), Command::PowerOff].map(Step::from);

        let result = session.apply(&steps, ChannelMapping::identity()).await;

        assert!(matches!(result, Err(Error::Timeout(_))));
        assert_eq!(probe.sent().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn mapping_reaches_transport() {
        let (mut session, probe) = session(paced(0)).await;
        let swap = ChannelMapping::swap(Channel::Green, Channel::Blue);
        session
            .apply(&[Step::once(Command::Color(Rgb::GREEN))], swap)
            .await
            .unwrap();
        assert_eq!(probe.sent(), vec![Sent::Command(Command::Color(Rgb::GREEN), swap)]);
    }

    #[tokio::test]
    async fn close_failure_keeps_command_result() {
        let mut transport = RecordingTransport::new();
        transport.fail_disconnect = true;
        let mut session = DeviceSession::new(transport);
        session.open(Duration::from_secs(1)).await.unwrap();

        let result: Result<()> = session
            .close_with(Err(Error::NotSupported("color temperature".into())))
            .await;
        assert!(matches!(result, Err(Error::NotSupported(_))));

        session.open(Duration::from_secs(1)).await.unwrap();
        assert_eq!(session.close_with(Ok::<_, Error>(7)).await.unwrap(), 7);
        assert!(!session.transport().connected);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_transport_rejects_writes() {
        let (mut session, _probe) = session(paced(0)).await;
        session.close().await.unwrap();
        assert!(matches!(
            session.apply(&[Step::once(Command::PowerOn)], ChannelMapping::identity()).await,
            Err(Error::NotConnected)
        ));
    }
}
