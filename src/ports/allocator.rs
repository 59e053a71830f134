use std::{collections::HashSet, fmt, net::TcpListener, sync::Arc};

use super::types::{PortError, PortPair};

pub const DEFAULT_SCAN_WINDOW: usize = 1000;

/// Returns true when `port` can be bound on all interfaces right now.
pub fn is_port_available(port: u16) -> bool {
    TcpListener::bind(("0.0.0.0", port)).is_ok()
}

/// Scans upward from `start_from` for `count` free ports, skipping `excluding`.
pub fn find_available_ports(
    count: usize,
    start_from: u16,
    excluding: &HashSet<u16>,
) -> Result<Vec<u16>, PortError> {
    PortAllocator::default().find_available_ports(count, start_from, excluding)
}

/// Scans the control and ADB ranges in lockstep for `count` free pairs.
pub fn find_port_pairs(
    count: usize,
    control_start: u16,
    adb_start: u16,
    excluding: &HashSet<u16>,
) -> Result<Vec<PortPair>, PortError> {
    PortAllocator::default().find_port_pairs(count, control_start, adb_start, excluding)
}

/// Scans one range per entry of `starts` in lockstep for `count` free sets.
pub fn find_port_sets(
    count: usize,
    starts: &[u16],
    excluding: &HashSet<u16>,
) -> Result<Vec<Vec<u16>>, PortError> {
    PortAllocator::default().find_port_sets(count, starts, excluding)
}

type Probe = Arc<dyn Fn(u16) -> bool + Send + Sync>;

/// Stateless port prober. Callers must record the ports it returns before
/// probing again; it holds no reservations of its own.
#[derive(Clone)]
pub struct PortAllocator {
    probe: Probe,
    window: usize,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self {
            probe: Arc::new(is_port_available),
            window: DEFAULT_SCAN_WINDOW,
        }
    }
}

impl fmt::Debug for PortAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortAllocator")
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}

impl PortAllocator {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            ..Self::default()
        }
    }

    pub fn with_probe(window: usize, probe: impl Fn(u16) -> bool + Send + Sync + 'static) -> Self {
        Self {
            probe: Arc::new(probe),
            window: window.max(1),
        }
    }

    pub fn window(&self) -> usize {
        self.window
    }

    pub fn is_available(&self, port: u16) -> bool {
        (self.probe)(port)
    }

    pub fn find_available_ports(
        &self,
        count: usize,
        start_from: u16,
        excluding: &HashSet<u16>,
    ) -> Result<Vec<u16>, PortError> {
        let budget = count.saturating_mul(self.window);
        let mut found = Vec::with_capacity(count);

        for offset in 0..budget {
            if found.len() == count {
                break;
            }
            let Some(port) = port_at(start_from, offset) else {
                break;
            };
            if excluding.contains(&port) {
                continue;
            }
            if self.is_available(port) {
                found.push(port);
            }
        }

        if found.len() < count {
            return Err(PortError::Exhausted {
                requested: count,
                found: found.len(),
                window: budget,
            });
        }
        Ok(found)
    }

    pub fn find_port_pairs(
        &self,
        count: usize,
        control_start: u16,
        adb_start: u16,
        excluding: &HashSet<u16>,
    ) -> Result<Vec<PortPair>, PortError> {
        let sets = self.find_port_sets(count, &[control_start, adb_start], excluding)?;
        Ok(sets
            .into_iter()
            .filter_map(|set| match set[..] {
                [control, adb] => Some(PortPair { control, adb }),
                _ => None,
            })
            .collect())
    }

    /// Scans one range per entry of `starts` in lockstep. Each returned set
    /// holds one port per range, in `starts` order, and no port appears in
    /// more than one set.
    pub fn find_port_sets(
        &self,
        count: usize,
        starts: &[u16],
        excluding: &HashSet<u16>,
    ) -> Result<Vec<Vec<u16>>, PortError> {
        let budget = count.saturating_mul(self.window);
        let mut taken: HashSet<u16> = HashSet::new();
        let mut sets = Vec::with_capacity(count);

        'scan: for offset in 0..budget {
            if sets.len() == count {
                break;
            }
            let mut set = Vec::with_capacity(starts.len());
            for start in starts {
                let Some(port) = port_at(*start, offset) else {
                    break 'scan;
                };
                if set.contains(&port) || excluding.contains(&port) || taken.contains(&port) {
                    continue 'scan;
                }
                set.push(port);
            }
            if set.iter().all(|port| self.is_available(*port)) {
                taken.extend(set.iter().copied());
                sets.push(set);
            }
        }

        if sets.len() < count {
            return Err(PortError::Exhausted {
                requested: count,
                found: sets.len(),
                window: budget,
            });
        }
        Ok(sets)
    }
}

fn port_at(start: u16, offset: usize) -> Option<u16> {
    u16::try_from(start as usize + offset).ok().filter(|port| *port != 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator_with_busy(busy: &'static [u16]) -> PortAllocator {
        PortAllocator::with_probe(10, move |port| !busy.contains(&port))
    }

    #[test]
    fn skips_busy_and_excluded_ports() {
        let allocator = allocator_with_busy(&[7001, 7003]);
        let excluding = HashSet::from([7002]);

        let ports = allocator.find_available_ports(2, 7000, &excluding).unwrap();
        assert_eq!(ports, vec![7000, 7004]);
    }

    #[test]
    fn reports_exhaustion_after_the_window() {
        let allocator = PortAllocator::with_probe(5, |_| false);
        let err = allocator
            .find_available_ports(2, 9000, &HashSet::new())
            .unwrap_err();
        assert_eq!(
            err,
            PortError::Exhausted {
                requested: 2,
                found: 0,
                window: 10
            }
        );
    }

    #[test]
    fn stops_at_the_top_of_the_port_range() {
        let allocator = PortAllocator::with_probe(100, |_| true);
        let err = allocator
            .find_available_ports(3, 65534, &HashSet::new())
            .unwrap_err();
        assert!(matches!(err, PortError::Exhausted { found: 2, .. }));
    }

    #[test]
    fn pairs_advance_in_lockstep_and_never_overlap() {
        let allocator = allocator_with_busy(&[6801, 5558]);
        let excluding = HashSet::from([6800]);

        let pairs = allocator
            .find_port_pairs(2, 6800, 5556, &excluding)
            .unwrap();
        assert_eq!(
            pairs,
            vec![
                PortPair {
                    control: 6803,
                    adb: 5559
                },
                PortPair {
                    control: 6804,
                    adb: 5560
                },
            ]
        );
    }

    #[test]
    fn overlapping_ranges_do_not_hand_out_a_port_twice() {
        let allocator = PortAllocator::with_probe(10, |_| true);
        let pairs = allocator
            .find_port_pairs(3, 8000, 8001, &HashSet::new())
            .unwrap();

        let mut seen = HashSet::new();
        for pair in &pairs {
            assert!(seen.insert(pair.control));
            assert!(seen.insert(pair.adb));
        }
    }

    #[test]
    fn four_way_sets_skip_an_offset_when_any_range_is_busy() {
        // control, adb, viewer, vnc
        let allocator = allocator_with_busy(&[7861]);
        let sets = allocator
            .find_port_sets(2, &[6800, 5556, 7860, 5800], &HashSet::from([5556]))
            .unwrap();
        assert_eq!(sets, vec![vec![6802, 5558, 7862, 5802], vec![6803, 5559, 7863, 5803]]);
    }

    #[test]
    fn never_returns_a_port_that_is_bound() {
        let listener = TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let bound = listener.local_addr().unwrap().port();

        let ports = find_available_ports(3, bound, &HashSet::new()).unwrap();
        assert!(!ports.contains(&bound));
        assert!(!is_port_available(bound));
    }
}
