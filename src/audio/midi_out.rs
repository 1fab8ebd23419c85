use super::AudioError;
use crate::events::ScheduledEvent;
use midir::{MidiOutput, MidiOutputConnection, MidiOutputPort};
use ringbuf::HeapCons;
use ringbuf::traits::Consumer;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Drains scheduled events from the audio thread and sends them to a MIDI
/// output port. Without a port the events are discarded.
pub struct MidiForwarder {
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

/// Index of the first port whose name contains `filter`, else the first port.
pub fn select_port(names: &[String], filter: Option<&str>) -> Option<usize> {
    filter
        .and_then(|filter| names.iter().position(|name| name.contains(filter)))
        .or_else(|| if names.is_empty() { None } else { Some(0) })
}

impl MidiForwarder {
    /// `overflows` is the audio callback's count of blocks that did not fit
    /// in the ring; this thread turns it into warnings.
    pub fn spawn(
        consumer: HeapCons<ScheduledEvent>,
        overflows: Arc<AtomicU64>,
        port_filter: Option<&str>,
    ) -> Result<Self, AudioError> {
        let connection = open_output(port_filter)?;
        let running = Arc::new(AtomicBool::new(true));
        let running_thread = running.clone();

        let thread = std::thread::Builder::new()
            .name("kiwi-midi-out".into())
            .spawn(move || {
                let monitor = OverflowMonitor::new(overflows);
                forward_loop(consumer, connection, monitor, &running_thread)
            })
            .map_err(|e| AudioError::Midi(e.to_string()))?;

        Ok(Self {
            running,
            thread: Some(thread),
        })
    }
}

impl Drop for MidiForwarder {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn open_output(port_filter: Option<&str>) -> Result<Option<MidiOutputConnection>, AudioError> {
    let midi_out = MidiOutput::new("kiwi").map_err(|e| AudioError::Midi(e.to_string()))?;
    let ports: Vec<MidiOutputPort> = midi_out.ports();
    let names: Vec<String> = ports
        .iter()
        .map(|p| midi_out.port_name(p).unwrap_or_default())
        .collect();

    let Some(index) = select_port(&names, port_filter) else {
        warn!("no MIDI output ports, events will be dropped");
        return Ok(None);
    };

    info!("MIDI output: {}", names[index]);
    let connection = midi_out
        .connect(&ports[index], "kiwi-out")
        .map_err(|e| AudioError::Midi(e.to_string()))?;
    Ok(Some(connection))
}

struct OverflowMonitor {
    overflows: Arc<AtomicU64>,
    reported: u64,
}

impl OverflowMonitor {
    fn new(overflows: Arc<AtomicU64>) -> Self {
        Self {
            overflows,
            reported: 0,
        }
    }

    /// Blocks that overflowed since the last call, if any.
    fn take_new(&mut self) -> Option<u64> {
        let total = self.overflows.load(Ordering::Relaxed);
        if total <= self.reported {
            return None;
        }
        let new = total - self.reported;
        self.reported = total;
        Some(new)
    }
}

fn forward_loop(
    mut consumer: HeapCons<ScheduledEvent>,
    mut connection: Option<MidiOutputConnection>,
    mut monitor: OverflowMonitor,
    running: &AtomicBool,
) {
    while running.load(Ordering::Acquire) {
        if let Some(blocks) = monitor.take_new() {
            warn!("event ring full, MIDI events dropped in {blocks} block(s)");
        }
        while let Some(event) = consumer.try_pop() {
            let Some(conn) = connection.as_mut() else {
                continue;
            };
            if let Err(e) = conn.send(&event.message.to_bytes()) {
                warn!("MIDI send failed: {e}");
            } else {
                debug!(at = event.sample_timestamp, "sent {:?}", event.message);
            }
        }
        std::thread::sleep(POLL_INTERVAL);
    }

    if let Some(conn) = connection {
        let _ = conn.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn port_filter_matches_substring() {
        let ports = names(&["Midi Through", "IAC Driver Bus 1", "USB Synth"]);
        assert_eq!(select_port(&ports, Some("IAC")), Some(1));
        assert_eq!(select_port(&ports, Some("Synth")), Some(2));
    }

    #[test]
    fn falls_back_to_first_port() {
        let ports = names(&["Midi Through", "USB Synth"]);
        assert_eq!(select_port(&ports, Some("missing")), Some(0));
        assert_eq!(select_port(&ports, None), Some(0));
        assert_eq!(select_port(&[], Some("IAC")), None);
    }

    #[test]
    fn overflow_monitor_reports_each_increase_once() {
        let overflows = Arc::new(AtomicU64::new(0));
        let mut monitor = OverflowMonitor::new(overflows.clone());
        assert_eq!(monitor.take_new(), None);

        overflows.fetch_add(3, Ordering::Relaxed);
        assert_eq!(monitor.take_new(), Some(3));
        assert_eq!(monitor.take_new(), None);

        overflows.fetch_add(1, Ordering::Relaxed);
        assert_eq!(monitor.take_new(), Some(1));
    }
}
