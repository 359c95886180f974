//! Synthetic shio devices for running the session without hardware.
//!
//! [`spawn_simulator`] speaks the same protocol as
//! [`ShioClient`](crate::shio_client::ShioClient): it consumes
//! [`LinkCommand`]s and produces [`ShioEvent`]s, so the session cannot tell
//! the difference.

use std::collections::HashSet;
use std::f64::consts::PI;
use std::time::Duration;

use log::info;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::parse::encode_samples;
use crate::types::{CharacteristicKind, DeviceId, LinkCommand, ShioEvent};

/// Simulated microphone rate.
pub const SIM_SAMPLE_RATE: f64 = 8_000.0;
/// Samples carried by one simulated notification.
pub const SIM_SAMPLES_PER_PACKET: usize = 120;

/// One synthetic microphone sample for channel `ch` (0-based) at time `t`.
///
/// A tone whose pitch depends on the channel, a weaker overtone and a little
/// deterministic noise, scaled into the i16 range.
pub fn sim_sample(t: f64, ch: usize) -> i16 {
    let phi = ch as f64 * PI / 2.5;
    let tone = 8_000.0 * (2.0 * PI * (220.0 + 110.0 * ch as f64) * t + phi).sin();
    let overtone = 2_000.0 * (2.0 * PI * 1_000.0 * t + phi * 1.7).sin();
    let nx = t * 1000.7 + ch as f64 * 137.508;
    let noise = ((nx.sin() * 9973.1).fract() - 0.5) * 600.0;
    (tone + overtone + noise).clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16
}

/// Spawn `devices` simulated sensors named `sim-1`, `sim-2`, ….
///
/// Every device is announced with `Discovered` followed by `Connected`.  A
/// device streams mic packets at [`SIM_SAMPLE_RATE`] once it receives
/// `Subscribe` and stops on `Unsubscribe`.  Role writes are logged.
///
/// The task ends when either channel closes.
pub fn spawn_simulator(
    devices: usize,
    events: mpsc::Sender<ShioEvent>,
    mut link: mpsc::Receiver<LinkCommand>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let ids: Vec<DeviceId> = (1..=devices)
            .map(|i| DeviceId(format!("sim-{i}")))
            .collect();

        for id in &ids {
            if events.send(ShioEvent::Discovered(id.clone())).await.is_err() {
                return;
            }
        }
        for id in &ids {
            if events.send(ShioEvent::Connected(id.clone())).await.is_err() {
                return;
            }
        }
        info!("simulator: {devices} device(s) connected");

        let dt = 1.0 / SIM_SAMPLE_RATE;
        let mut ticker = tokio::time::interval(Duration::from_secs_f64(
            SIM_SAMPLES_PER_PACKET as f64 * dt,
        ));
        let mut streaming: HashSet<DeviceId> = HashSet::new();
        let mut t = 0.0_f64;

        loop {
            tokio::select! {
                cmd = link.recv() => match cmd {
                    None => break,
                    Some(LinkCommand::Subscribe(id)) => {
                        if ids.contains(&id) {
                            info!("simulator: {id} streaming");
                            streaming.insert(id);
                        }
                    }
                    Some(LinkCommand::Unsubscribe(id)) => {
                        streaming.remove(&id);
                    }
                    Some(LinkCommand::WriteRole { device, byte }) => {
                        info!("simulator: {device} role byte 0x{byte:02x}");
                    }
                },
                _ = ticker.tick() => {
                    for (ch, id) in ids.iter().enumerate() {
                        if !streaming.contains(id) {
                            continue;
                        }
                        let samples: Vec<i16> = (0..SIM_SAMPLES_PER_PACKET)
                            .map(|i| sim_sample(t + i as f64 * dt, ch))
                            .collect();
                        let packet = ShioEvent::Packet {
                            device: id.clone(),
                            kind: CharacteristicKind::MicData,
                            data: encode_samples(&samples),
                        };
                        if events.send(packet).await.is_err() {
                            return;
                        }
                    }
                    t += SIM_SAMPLES_PER_PACKET as f64 * dt;
                }
            }
        }
        info!("simulator stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::decode_samples;

    async fn next_event(rx: &mut mpsc::Receiver<ShioEvent>) -> ShioEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("simulator event")
            .expect("channel open")
    }

    #[test]
    fn samples_stay_bounded_and_differ_per_channel() {
        for i in 0..1000 {
            let t = i as f64 / SIM_SAMPLE_RATE;
            let a = sim_sample(t, 0);
            assert!(a.unsigned_abs() < 11_000);
        }
        let t = 0.01;
        assert_ne!(sim_sample(t, 0), sim_sample(t, 1));
    }

    #[tokio::test]
    async fn announces_then_streams_after_subscribe() {
        let (ev_tx, mut ev_rx) = mpsc::channel(64);
        let (link_tx, link_rx) = mpsc::channel(8);
        let task = spawn_simulator(2, ev_tx, link_rx);

        assert!(matches!(next_event(&mut ev_rx).await, ShioEvent::Discovered(id) if id.0 == "sim-1"));
        assert!(matches!(next_event(&mut ev_rx).await, ShioEvent::Discovered(id) if id.0 == "sim-2"));
        assert!(matches!(next_event(&mut ev_rx).await, ShioEvent::Connected(id) if id.0 == "sim-1"));
        assert!(matches!(next_event(&mut ev_rx).await, ShioEvent::Connected(id) if id.0 == "sim-2"));

        link_tx.send(LinkCommand::Subscribe("sim-2".into())).await.unwrap();
        for _ in 0..3 {
            match next_event(&mut ev_rx).await {
                ShioEvent::Packet { device, kind, data } => {
                    assert_eq!(device, DeviceId::from("sim-2"));
                    assert_eq!(kind, CharacteristicKind::MicData);
                    assert_eq!(decode_samples(&data).len(), SIM_SAMPLES_PER_PACKET);
                }
                other => panic!("unexpected event {other:?}"),
            }
        }

        drop(link_tx);
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("simulator exits when the link channel closes")
            .unwrap();
    }
}
