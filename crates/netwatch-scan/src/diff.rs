//! Change detection between consecutive snapshots.
//!
//! Devices are matched by hardware address only. An IP change alone is
//! not reported; a port-set change is.

use std::collections::{BTreeSet, HashMap};
use std::sync::{PoisonError, RwLock};

use netwatch_core::{ChangeEvent, Device};

/// Holds the previous snapshot and diffs new ones against it.
#[derive(Default)]
pub struct StateDiffer {
    previous: RwLock<HashMap<String, Device>>,
}

impl StateDiffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A differ whose baseline is `devices`, e.g. loaded from the store.
    pub fn seeded(devices: &[Device]) -> Self {
        let differ = Self::new();
        differ.update_state(devices);
        differ
    }

    /// Diff `current` against `previous`.
    ///
    /// Arrivals and port changes come first in `current` order, followed by
    /// departures ordered by MAC.
    pub fn compare(previous: &[Device], current: &[Device]) -> Vec<ChangeEvent> {
        let before: HashMap<&str, &Device> =
            previous.iter().map(|d| (d.mac.as_str(), d)).collect();
        compare_against(&before, current)
    }

    /// Diff `current` against the retained baseline without replacing it.
    pub fn detect(&self, current: &[Device]) -> Vec<ChangeEvent> {
        let previous = self.previous.read().unwrap_or_else(PoisonError::into_inner);
        let before: HashMap<&str, &Device> =
            previous.iter().map(|(mac, d)| (mac.as_str(), d)).collect();
        compare_against(&before, current)
    }

    /// Replace the baseline with a private copy of `current`.
    pub fn update_state(&self, current: &[Device]) {
        let next: HashMap<String, Device> = current
            .iter()
            .map(|d| (d.mac.clone(), d.clone()))
            .collect();
        *self.previous.write().unwrap_or_else(PoisonError::into_inner) = next;
    }

    /// Copy of the baseline, ordered by MAC.
    pub fn previous_devices(&self) -> Vec<Device> {
        let previous = self.previous.read().unwrap_or_else(PoisonError::into_inner);
        let mut devices: Vec<Device> = previous.values().cloned().collect();
        devices.sort_by(|a, b| a.mac.cmp(&b.mac));
        devices
    }

    pub fn len(&self) -> usize {
        self.previous
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn compare_against(before: &HashMap<&str, &Device>, current: &[Device]) -> Vec<ChangeEvent> {
    let mut events = Vec::new();
    let mut seen: BTreeSet<&str> = BTreeSet::new();

    for device in current {
        if !seen.insert(device.mac.as_str()) {
            continue;
        }
        match before.get(device.mac.as_str()) {
            None => events.push(ChangeEvent::arrival(device.clone())),
            Some(old) => {
                let changed = port_delta(&old.open_ports, &device.open_ports);
                if !changed.is_empty() {
                    events.push(ChangeEvent::port_change(
                        (*old).clone(),
                        device.clone(),
                        changed,
                    ));
                }
            }
        }
    }

    let mut gone: Vec<&&Device> = before
        .iter()
        .filter(|(mac, _)| !seen.contains(*mac))
        .map(|(_, d)| d)
        .collect();
    gone.sort_by(|a, b| a.mac.cmp(&b.mac));
    events.extend(gone.into_iter().map(|d| ChangeEvent::departure((*d).clone())));

    events
}

/// Ports open in exactly one of `old` and `new`, ascending.
pub fn port_delta(old: &[u16], new: &[u16]) -> Vec<u16> {
    let old: BTreeSet<u16> = old.iter().copied().collect();
    let new: BTreeSet<u16> = new.iter().copied().collect();
    old.symmetric_difference(&new).copied().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use netwatch_core::{ChangeKind, Severity};

    fn device(mac: &str, ip: &str, ports: &[u16]) -> Device {
        Device::new(mac, ip.parse().unwrap()).with_ports(ports.iter().copied())
    }

    #[test]
    fn test_port_delta_is_symmetric_difference() {
        assert_eq!(port_delta(&[22, 80], &[22, 443]), vec![80, 443]);
        assert_eq!(port_delta(&[], &[53]), vec![53]);
        assert_eq!(port_delta(&[8080, 22], &[]), vec![22, 8080]);
        assert!(port_delta(&[22, 80, 443], &[443, 80, 22]).is_empty());
    }

    #[test]
    fn test_arrival_of_first_device() {
        let current = vec![device("m1", "10.0.0.5", &[22, 80])];
        let events = StateDiffer::compare(&[], &current);

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ChangeKind::NewDevice);
        assert_eq!(events[0].mac(), "m1");
        assert_eq!(events[0].severity, Severity::Info);
    }

    #[test]
    fn test_port_change_carries_both_snapshots() {
        let previous = vec![device("m1", "10.0.0.5", &[22, 80])];
        let current = vec![device("m1", "10.0.0.5", &[22, 443])];
        let events = StateDiffer::compare(&previous, &current);

        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.kind, ChangeKind::PortChange);
        assert_eq!(event.severity, Severity::Warning);
        let mut changed = event.changed_ports.clone();
        changed.sort_unstable();
        assert_eq!(changed, vec![80, 443]);
        assert_eq!(event.previous.as_ref().unwrap().open_ports, vec![22, 80]);
        assert_eq!(event.device.open_ports, vec![22, 443]);
    }

    #[test]
    fn test_departure_only_for_missing_device() {
        let previous = vec![
            device("m1", "10.0.0.5", &[22]),
            device("m2", "10.0.0.6", &[80]),
        ];
        let current = vec![device("m2", "10.0.0.6", &[80])];
        let events = StateDiffer::compare(&previous, &current);

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ChangeKind::Disconnected);
        assert_eq!(events[0].mac(), "m1");
        assert_eq!(events[0].severity, Severity::Warning);
    }

    #[test]
    fn test_disjoint_snapshots() {
        let previous = vec![
            device("a1", "10.0.0.1", &[]),
            device("a2", "10.0.0.2", &[22]),
        ];
        let current = vec![
            device("b1", "10.0.0.1", &[]),
            device("b2", "10.0.0.2", &[22]),
            device("b3", "10.0.0.3", &[80]),
        ];
        let events = StateDiffer::compare(&previous, &current);

        let count = |kind| events.iter().filter(|e| e.kind == kind).count();
        assert_eq!(count(ChangeKind::NewDevice), 3);
        assert_eq!(count(ChangeKind::Disconnected), 2);
        assert_eq!(count(ChangeKind::PortChange), 0);
    }

    #[test]
    fn test_ip_change_alone_is_silent() {
        let previous = vec![device("m1", "10.0.0.5", &[22])];
        let current = vec![device("m1", "10.0.0.99", &[22])];
        assert!(StateDiffer::compare(&previous, &current).is_empty());
    }

    #[test]
    fn test_update_state_is_idempotent() {
        let snapshot = vec![
            device("m1", "10.0.0.5", &[22]),
            device("m2", "10.0.0.6", &[80]),
        ];
        let next = vec![device("m1", "10.0.0.5", &[22, 443])];

        let once = StateDiffer::new();
        once.update_state(&snapshot);
        let twice = StateDiffer::new();
        twice.update_state(&snapshot);
        twice.update_state(&snapshot);

        let summary = |events: Vec<ChangeEvent>| -> Vec<(ChangeKind, String, Vec<u16>)> {
            events
                .into_iter()
                .map(|e| (e.kind, e.device.mac, e.changed_ports))
                .collect()
        };
        assert_eq!(summary(once.detect(&next)), summary(twice.detect(&next)));
        assert_eq!(twice.len(), 2);
    }

    #[test]
    fn test_detect_does_not_replace_baseline() {
        let differ = StateDiffer::seeded(&[device("m1", "10.0.0.5", &[22])]);
        let current = vec![device("m2", "10.0.0.6", &[])];

        assert_eq!(differ.detect(&current).len(), 2);
        assert_eq!(differ.detect(&current).len(), 2);

        differ.update_state(&current);
        assert!(differ.detect(&current).is_empty());
        assert_eq!(differ.previous_devices()[0].mac, "m2");
    }

    #[test]
    fn test_retained_state_is_a_copy() {
        let mut snapshot = vec![device("m1", "10.0.0.5", &[22])];
        let differ = StateDiffer::seeded(&snapshot);

        snapshot[0].set_open_ports([22, 8080]);
        assert_eq!(differ.previous_devices()[0].open_ports, vec![22]);
        assert_eq!(differ.detect(&snapshot).len(), 1);
    }
}
