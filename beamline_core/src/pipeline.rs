//! Event loop and the capability traits it drives.
//!
//! The loop is strictly sequential: read one event, run all processors in
//! registration order, run all analyzers in registration order, optionally
//! persist the event, repeat. Analyzers are finalized once after the last
//! event. There are no worker threads or queues; alignment iterations wrap
//! this loop from the outside.

use tracing::{debug, info};

use crate::error::Error;
use crate::event::Event;

/// Event source.
pub trait Reader {
    fn name(&self) -> &str;
    /// Minimum number of events that can still be read, if known.
    fn num_events(&self) -> Option<u64>;
    /// Number of sensors per event.
    fn num_sensors(&self) -> usize;
    /// Skip the next n events. Seeking past the end must not fail; the
    /// following `read` reports the end instead.
    fn skip(&mut self, n: u64) -> Result<(), Error>;
    /// Read the next event into the given container.
    ///
    /// The implementation must clear the event and either fully populate it
    /// and return true, or return false once no more events are available.
    /// Errors are reported through the `Result`, never through the flag.
    fn read(&mut self, event: &mut Event) -> Result<bool, Error>;
}

/// Event sink.
pub trait Writer {
    fn name(&self) -> &str;
    /// Persist a single event. The event must match the sensor count the
    /// writer was created with.
    fn append(&mut self, event: &Event) -> Result<(), Error>;
}

/// An algorithm that modifies events, e.g. clustering or track finding.
pub trait Processor {
    fn name(&self) -> &str;
    fn execute(&self, event: &mut Event) -> Result<(), Error>;
}

/// An algorithm that observes events and publishes results at the end.
pub trait Analyzer {
    fn name(&self) -> &str;
    fn execute(&mut self, event: &Event) -> Result<(), Error>;
    /// Called once after the last event; optional.
    fn finalize(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

/// An analyzer that accumulates alignment information and can produce a
/// corrected geometry once the loop has finished.
pub trait Aligner: Analyzer {
    fn updated_geometry(&self) -> Result<crate::geometry::Geometry, Error>;
}

/// Sequential driver over a reader, processors, and analyzers.
pub struct EventLoop<'a> {
    reader: &'a mut dyn Reader,
    writer: Option<&'a mut dyn Writer>,
    processors: Vec<&'a dyn Processor>,
    analyzers: Vec<&'a mut dyn Analyzer>,
    skip: u64,
    limit: Option<u64>,
}

impl<'a> EventLoop<'a> {
    pub fn new(reader: &'a mut dyn Reader) -> Self {
        Self {
            reader,
            writer: None,
            processors: Vec::new(),
            analyzers: Vec::new(),
            skip: 0,
            limit: None,
        }
    }

    /// Skip this many events before processing starts.
    pub fn skip_events(mut self, n: u64) -> Self {
        self.skip = n;
        self
    }

    /// Process at most this many events.
    pub fn limit_events(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }

    pub fn set_writer(&mut self, writer: &'a mut dyn Writer) {
        self.writer = Some(writer);
    }

    pub fn add_processor(&mut self, processor: &'a dyn Processor) {
        self.processors.push(processor);
    }

    pub fn add_analyzer(&mut self, analyzer: &'a mut dyn Analyzer) {
        self.analyzers.push(analyzer);
    }

    /// Run over all events and finalize the analyzers.
    ///
    /// Returns the number of processed events.
    pub fn run(mut self) -> Result<u64, Error> {
        let mut event = Event::new(self.reader.num_sensors());
        if 0 < self.skip {
            self.reader.skip(self.skip)?;
        }

        let mut processed = 0u64;
        loop {
            if let Some(limit) = self.limit {
                if limit <= processed {
                    break;
                }
            }
            if !self.reader.read(&mut event)? {
                break;
            }
            for processor in self.processors.iter() {
                processor.execute(&mut event)?;
            }
            for analyzer in self.analyzers.iter_mut() {
                analyzer.execute(&event)?;
            }
            if let Some(writer) = self.writer.as_mut() {
                writer.append(&event)?;
            }
            processed += 1;
            if processed % 10000 == 0 {
                debug!("processed {} events", processed);
            }
        }

        for analyzer in self.analyzers.iter_mut() {
            analyzer.finalize()?;
        }
        info!("processed {} events from {}", processed, self.reader.name());
        Ok(processed)
    }
}
