//! In-memory event source replaying generated pixel data.

use std::sync::Arc;

use beamline_core::error::Error;
use beamline_core::event::Event;
use beamline_core::pipeline::Reader;

use crate::oracle::SimEvent;

/// Replays a generated event sample through the reader contract.
///
/// The same sample can be replayed any number of times, which is what the
/// alignment iteration does with updated geometries.
pub struct SimReader {
    events: Arc<Vec<SimEvent>>,
    num_sensors: usize,
    next: u64,
}

impl SimReader {
    pub fn new(events: Arc<Vec<SimEvent>>) -> Self {
        let num_sensors = events.first().map_or(0, |e| e.hits.len());
        Self {
            events,
            num_sensors,
            next: 0,
        }
    }
}

impl Reader for SimReader {
    fn name(&self) -> &str {
        "SimReader"
    }

    fn num_events(&self) -> Option<u64> {
        Some((self.events.len() as u64).saturating_sub(self.next))
    }

    fn num_sensors(&self) -> usize {
        self.num_sensors
    }

    fn skip(&mut self, n: u64) -> Result<(), Error> {
        self.next += n;
        Ok(())
    }

    fn read(&mut self, event: &mut Event) -> Result<bool, Error> {
        let Some(sim) = self.events.get(self.next as usize) else {
            return Ok(false);
        };
        event.clear(sim.frame, sim.timestamp);
        for (sensor_id, sensor_hits) in sim.hits.iter().enumerate() {
            let sensor_event = event.sensor_event_mut(sensor_id);
            for &(col, row, timestamp, value) in sensor_hits {
                sensor_event.add_hit(col, row, timestamp, value);
            }
        }
        self.next += 1;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replays_events_and_reports_the_end() {
        let events = Arc::new(vec![
            SimEvent {
                frame: 0,
                timestamp: 0,
                hits: vec![vec![(1, 2, 0, 1)], vec![]],
            },
            SimEvent {
                frame: 1,
                timestamp: 10,
                hits: vec![vec![], vec![(3, 4, 0, 1), (5, 6, 0, 1)]],
            },
        ]);
        let mut reader = SimReader::new(events);
        assert_eq!(reader.num_sensors(), 2);
        assert_eq!(reader.num_events(), Some(2));

        let mut event = Event::new(2);
        assert!(reader.read(&mut event).unwrap());
        assert_eq!(event.sensor_event(0).num_hits(), 1);
        assert!(reader.read(&mut event).unwrap());
        assert_eq!(event.frame(), 1);
        assert_eq!(event.sensor_event(0).num_hits(), 0);
        assert_eq!(event.sensor_event(1).num_hits(), 2);
        assert!(!reader.read(&mut event).unwrap());
    }
}
