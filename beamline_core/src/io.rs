//! Binary event records.
//!
//! One file holds a header followed by length-prefixed event frames. Each
//! frame carries the global event information, the global tracks, and per
//! sensor the hit, cluster, and local-state streams. All integers are
//! little endian; counts are signed 32-bit values and spatial covariances
//! are stored as the packed lower triangle of the 4x4 block.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::config::Device;
use crate::error::Error;
use crate::event::{Cluster, Event, Track, TrackState};
use crate::pipeline::{Reader, Writer};

const MAGIC: &[u8; 8] = b"BEAMEVT0";
const VERSION: u32 = 1;
// byte offset of the event count inside the header
const NUM_EVENTS_OFFSET: u64 = 16;
const HEADER_LEN: usize = 24;
// per-event limit for each stream
const MAX_ENTRIES: usize = 1 << 14;

fn check_count(count: i32, what: &str) -> Result<usize, Error> {
    if count < 0 || (MAX_ENTRIES as i32) < count {
        return Err(Error::format(format!("invalid {what} count {count}")));
    }
    Ok(count as usize)
}

fn need(buf: &Bytes, bytes: usize, what: &str) -> Result<(), Error> {
    if buf.remaining() < bytes {
        Err(Error::format(format!("truncated event record in {what}")))
    } else {
        Ok(())
    }
}

/// Writes events to a binary record file.
pub struct RecordWriter {
    file: File,
    num_sensors: usize,
    num_events: u64,
    name: String,
}

impl RecordWriter {
    /// Create a new file, truncating existing content.
    pub fn create(path: &Path, num_sensors: usize) -> Result<Self, Error> {
        let mut file = File::create(path)?;
        let mut header = BytesMut::with_capacity(HEADER_LEN);
        header.put_slice(MAGIC);
        header.put_u32_le(VERSION);
        header.put_u32_le(num_sensors as u32);
        header.put_u64_le(0);
        file.write_all(&header)?;
        Ok(Self {
            file,
            num_sensors,
            num_events: 0,
            name: format!("RecordWriter({})", path.display()),
        })
    }

    /// Write the final event count into the header and close the file.
    pub fn finalize(mut self) -> Result<(), Error> {
        self.file.seek(SeekFrom::Start(NUM_EVENTS_OFFSET))?;
        self.file.write_all(&self.num_events.to_le_bytes())?;
        self.file.flush()?;
        Ok(())
    }

    fn encode(&self, event: &Event) -> Result<BytesMut, Error> {
        let mut buf = BytesMut::new();
        buf.put_u64_le(event.frame());
        buf.put_u64_le(event.timestamp());
        buf.put_u64_le(event.trigger_time());
        buf.put_i32_le(event.trigger_offset());
        buf.put_i32_le(event.trigger_info());
        buf.put_i32_le(event.trigger_phase());
        buf.put_u8(event.invalid() as u8);

        if MAX_ENTRIES < event.num_tracks() {
            return Err(Error::event(format!(
                "event {} has too many tracks",
                event.frame()
            )));
        }
        buf.put_i32_le(event.num_tracks() as i32);
        for track in event.tracks() {
            let state = track.global_state();
            buf.put_f64_le(track.chi2());
            buf.put_i32_le(track.degrees_of_freedom());
            buf.put_f64_le(state.loc0());
            buf.put_f64_le(state.loc1());
            buf.put_f64_le(state.slope_loc0());
            buf.put_f64_le(state.slope_loc1());
            for value in state.spatial_cov_packed() {
                buf.put_f64_le(value);
            }
        }

        for sensor_id in 0..self.num_sensors {
            let sensor_event = event.sensor_event(sensor_id);
            let too_many = |what: &str| {
                Error::event(format!(
                    "event {} sensor {} has too many {}",
                    event.frame(),
                    sensor_id,
                    what
                ))
            };

            if MAX_ENTRIES < sensor_event.num_hits() {
                return Err(too_many("hits"));
            }
            buf.put_i32_le(sensor_event.num_hits() as i32);
            for hit in sensor_event.hits() {
                buf.put_i32_le(hit.col());
                buf.put_i32_le(hit.row());
                buf.put_i32_le(hit.timestamp());
                buf.put_i32_le(hit.value());
                buf.put_i32_le(hit.cluster().map_or(-1, |c| c as i32));
            }

            if MAX_ENTRIES < sensor_event.num_clusters() {
                return Err(too_many("clusters"));
            }
            buf.put_i32_le(sensor_event.num_clusters() as i32);
            for cluster in sensor_event.clusters() {
                buf.put_f64_le(cluster.col());
                buf.put_f64_le(cluster.row());
                buf.put_f64_le(cluster.col_var());
                buf.put_f64_le(cluster.row_var());
                buf.put_f64_le(cluster.col_row_cov());
                buf.put_f64_le(cluster.timestamp());
                buf.put_f64_le(cluster.value());
                buf.put_i32_le(cluster.track().map_or(-1, |t| t as i32));
            }

            if MAX_ENTRIES < sensor_event.num_local_states() {
                return Err(too_many("local states"));
            }
            buf.put_i32_le(sensor_event.num_local_states() as i32);
            for (itrack, state) in sensor_event.local_states() {
                buf.put_i32_le(itrack as i32);
                buf.put_f64_le(state.loc0());
                buf.put_f64_le(state.loc1());
                buf.put_f64_le(state.slope_loc0());
                buf.put_f64_le(state.slope_loc1());
                for value in state.spatial_cov_packed() {
                    buf.put_f64_le(value);
                }
            }
        }
        Ok(buf)
    }
}

impl Writer for RecordWriter {
    fn name(&self) -> &str {
        &self.name
    }

    fn append(&mut self, event: &Event) -> Result<(), Error> {
        if event.num_sensor_events() != self.num_sensors {
            return Err(Error::event(format!(
                "event has {} sensors but the writer expects {}",
                event.num_sensor_events(),
                self.num_sensors
            )));
        }
        let payload = self.encode(event)?;
        let mut frame = BytesMut::with_capacity(4 + payload.len());
        frame.put_u32_le(payload.len() as u32);
        frame.put_slice(&payload);
        self.file.write_all(&frame)?;
        self.num_events += 1;
        Ok(())
    }
}

/// Reads events back from a binary record file.
///
/// When constructed with a device, cluster positions are transformed into
/// the local and global frames on read; otherwise the positions stay
/// undefined and only the pixel-coordinate content is available.
pub struct RecordReader {
    file: BufReader<File>,
    num_sensors: usize,
    num_events: u64,
    next: u64,
    device: Option<Arc<Device>>,
    name: String,
}

impl RecordReader {
    pub fn open(path: &Path) -> Result<Self, Error> {
        let mut file = BufReader::new(File::open(path)?);
        let mut header = [0u8; HEADER_LEN];
        file.read_exact(&mut header)
            .map_err(|_| Error::format("file too short for record header"))?;
        let mut buf = Bytes::copy_from_slice(&header);
        let mut magic = [0u8; 8];
        buf.copy_to_slice(&mut magic);
        if &magic != MAGIC {
            return Err(Error::format("not an event record file"));
        }
        let version = buf.get_u32_le();
        if version != VERSION {
            return Err(Error::format(format!(
                "unsupported record version {version}"
            )));
        }
        let num_sensors = buf.get_u32_le() as usize;
        let num_events = buf.get_u64_le();
        Ok(Self {
            file,
            num_sensors,
            num_events,
            next: 0,
            device: None,
            name: format!("RecordReader({})", path.display()),
        })
    }

    /// Attach a device so that cluster positions are derived on read.
    pub fn with_device(mut self, device: Arc<Device>) -> Result<Self, Error> {
        if device.num_sensors() != self.num_sensors {
            return Err(Error::config(format!(
                "record file has {} sensors but the device has {}",
                self.num_sensors,
                device.num_sensors()
            )));
        }
        self.device = Some(device);
        Ok(self)
    }

    fn read_frame(&mut self) -> Result<Option<Bytes>, Error> {
        let mut len_bytes = [0u8; 4];
        match self.file.read_exact(&mut len_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        }
        let len = u32::from_le_bytes(len_bytes) as usize;
        let mut payload = vec![0u8; len];
        self.file
            .read_exact(&mut payload)
            .map_err(|_| Error::format("truncated event record"))?;
        Ok(Some(Bytes::from(payload)))
    }

    fn decode(&self, mut buf: Bytes, event: &mut Event) -> Result<(), Error> {
        need(&buf, 8 * 3 + 4 * 3 + 1, "event header")?;
        let frame = buf.get_u64_le();
        let timestamp = buf.get_u64_le();
        let trigger_time = buf.get_u64_le();
        let trigger_offset = buf.get_i32_le();
        let trigger_info = buf.get_i32_le();
        let trigger_phase = buf.get_i32_le();
        let invalid = buf.get_u8() != 0;

        event.clear(frame, timestamp);
        event.set_trigger(trigger_time, trigger_offset, trigger_info, trigger_phase);
        event.set_invalid(invalid);

        need(&buf, 4, "track count")?;
        let num_tracks = check_count(buf.get_i32_le(), "track")?;
        let mut tracks = Vec::with_capacity(num_tracks);
        for _ in 0..num_tracks {
            need(&buf, 8 + 4 + 14 * 8, "track")?;
            let chi2 = buf.get_f64_le();
            let dof = buf.get_i32_le();
            let mut state = TrackState::new(
                buf.get_f64_le(),
                buf.get_f64_le(),
                buf.get_f64_le(),
                buf.get_f64_le(),
            );
            let mut packed = [0.0; 10];
            for value in packed.iter_mut() {
                *value = buf.get_f64_le();
            }
            state.set_spatial_cov_packed(&packed);
            let mut track = Track::new();
            track.set_global_state(state);
            track.set_goodness_of_fit(chi2, dof);
            tracks.push(track);
        }

        for sensor_id in 0..self.num_sensors {
            need(&buf, 4, "hit count")?;
            let num_hits = check_count(buf.get_i32_le(), "hit")?;
            let mut hit_clusters = Vec::with_capacity(num_hits);
            for _ in 0..num_hits {
                need(&buf, 5 * 4, "hit")?;
                let col = buf.get_i32_le();
                let row = buf.get_i32_le();
                let time = buf.get_i32_le();
                let value = buf.get_i32_le();
                let cluster = buf.get_i32_le();
                event.sensor_event_mut(sensor_id).add_hit(col, row, time, value);
                hit_clusters.push(cluster);
            }

            need(&buf, 4, "cluster count")?;
            let num_clusters = check_count(buf.get_i32_le(), "cluster")?;
            for icluster in 0..num_clusters {
                need(&buf, 7 * 8 + 4, "cluster")?;
                let col = buf.get_f64_le();
                let row = buf.get_f64_le();
                let col_var = buf.get_f64_le();
                let row_var = buf.get_f64_le();
                let col_row_cov = buf.get_f64_le();
                let time = buf.get_f64_le();
                let value = buf.get_f64_le();
                let itrack = buf.get_i32_le();

                let mut cluster =
                    Cluster::new(col, row, time, value, col_var, row_var, col_row_cov, 0.0);
                if let Some(device) = self.device.as_ref() {
                    transform_cluster(device, sensor_id, &mut cluster);
                }
                event.sensor_event_mut(sensor_id).add_cluster(cluster);

                if 0 <= itrack {
                    let itrack = itrack as usize;
                    if num_tracks <= itrack {
                        return Err(Error::format(format!(
                            "cluster references invalid track {itrack}"
                        )));
                    }
                    tracks[itrack].add_cluster(sensor_id, icluster);
                }
            }

            // hit-to-cluster links can only be applied once the clusters exist
            for (ihit, &icluster) in hit_clusters.iter().enumerate() {
                if icluster < 0 {
                    continue;
                }
                if num_clusters <= icluster as usize {
                    return Err(Error::format(format!(
                        "hit references invalid cluster {icluster}"
                    )));
                }
                event
                    .sensor_event_mut(sensor_id)
                    .add_cluster_hit(icluster as usize, ihit);
            }

            need(&buf, 4, "state count")?;
            let num_states = check_count(buf.get_i32_le(), "local state")?;
            for _ in 0..num_states {
                need(&buf, 4 + 14 * 8, "local state")?;
                let itrack = buf.get_i32_le();
                let mut state = TrackState::new(
                    buf.get_f64_le(),
                    buf.get_f64_le(),
                    buf.get_f64_le(),
                    buf.get_f64_le(),
                );
                let mut packed = [0.0; 10];
                for value in packed.iter_mut() {
                    *value = buf.get_f64_le();
                }
                state.set_spatial_cov_packed(&packed);
                if (itrack < 0) || (num_tracks <= itrack as usize) {
                    return Err(Error::format(format!(
                        "local state references invalid track {itrack}"
                    )));
                }
                event
                    .sensor_event_mut(sensor_id)
                    .set_local_state(itrack as usize, state);
            }
        }

        if buf.has_remaining() {
            return Err(Error::format("event record has trailing bytes"));
        }

        for track in tracks {
            event.add_track(track);
        }
        Ok(())
    }
}

fn transform_cluster(device: &Device, sensor_id: usize, cluster: &mut Cluster) {
    let sensor = device.sensor(sensor_id);
    let plane = device.geometry().plane(sensor_id);
    let pos_local = sensor.transform_pixel_to_local(cluster.col(), cluster.row(), cluster.timestamp());
    let pc = sensor.pitch_col();
    let pr = sensor.pitch_row();
    let mut cov_local = nalgebra::Matrix4::zeros();
    cov_local[(0, 0)] = pc * pc * cluster.col_var();
    cov_local[(1, 1)] = pr * pr * cluster.row_var();
    cov_local[(0, 1)] = pc * pr * cluster.col_row_cov();
    cov_local[(1, 0)] = cov_local[(0, 1)];
    let pos_global = plane.to_global(&pos_local);
    let cov_global = plane.cov_to_global(&cov_local);
    cluster.set_local(pos_local, cov_local);
    cluster.set_global(pos_global, cov_global);
}

impl Reader for RecordReader {
    fn name(&self) -> &str {
        &self.name
    }

    fn num_events(&self) -> Option<u64> {
        Some(self.num_events.saturating_sub(self.next))
    }

    fn num_sensors(&self) -> usize {
        self.num_sensors
    }

    fn skip(&mut self, n: u64) -> Result<(), Error> {
        for _ in 0..n {
            if self.read_frame()?.is_none() {
                break;
            }
            self.next += 1;
        }
        Ok(())
    }

    fn read(&mut self, event: &mut Event) -> Result<bool, Error> {
        if event.num_sensor_events() < self.num_sensors {
            return Err(Error::event(format!(
                "event container has {} sensors but the record has {}",
                event.num_sensor_events(),
                self.num_sensors
            )));
        }
        let Some(payload) = self.read_frame()? else {
            return Ok(false);
        };
        self.decode(payload, event)?;
        self.next += 1;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn sample_event() -> Event {
        let mut event = Event::new(2);
        event.clear(7, 1234);
        event.set_trigger(99, 3, 1, -1);

        let sev = event.sensor_event_mut(0);
        let h0 = sev.add_hit(10, 10, 1, 5);
        let h1 = sev.add_hit(11, 10, 2, 3);
        let c0 = sev.add_cluster(Cluster::new(10.5, 10.0, 1.5, 8.0, 0.25, 1.0 / 12.0, 0.0, 0.0));
        sev.add_cluster_hit(c0, h0);
        sev.add_cluster_hit(c0, h1);

        let sev = event.sensor_event_mut(1);
        let h = sev.add_hit(20, 30, 0, 1);
        let c1 = sev.add_cluster(Cluster::new(
            20.0,
            30.0,
            0.0,
            1.0,
            1.0 / 12.0,
            1.0 / 12.0,
            0.0,
            0.0,
        ));
        sev.add_cluster_hit(c1, h);

        let mut state = TrackState::new(0.1, 0.2, 0.01, 0.02);
        state.set_cov_u(1e-4, 1e-6, 1e-5);
        state.set_cov_v(2e-4, 2e-6, 2e-5);
        let mut track = Track::new();
        track.set_global_state(state);
        track.set_goodness_of_fit(1.5, 2);
        track.add_cluster(0, c0);
        track.add_cluster(1, c1);
        let itrack = event.add_track(track);

        let mut local = TrackState::new(0.3, -0.4, 0.05, -0.06);
        local.set_cov_u(1e-3, 1e-5, 0.0);
        event.sensor_event_mut(0).set_local_state(itrack, local);
        event
    }

    #[test]
    fn events_round_trip_through_the_record_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.rec");

        let mut writer = RecordWriter::create(&path, 2).unwrap();
        let original = sample_event();
        writer.append(&original).unwrap();
        writer.append(&original).unwrap();
        writer.finalize().unwrap();

        let mut reader = RecordReader::open(&path).unwrap();
        assert_eq!(reader.num_sensors(), 2);
        assert_eq!(reader.num_events(), Some(2));

        let mut event = Event::new(2);
        assert!(reader.read(&mut event).unwrap());
        assert_eq!(event.frame(), 7);
        assert_eq!(event.timestamp(), 1234);
        assert_eq!(event.trigger_time(), 99);
        assert_eq!(event.trigger_phase(), -1);

        // hits and their cluster links
        let sev = event.sensor_event(0);
        assert_eq!(sev.num_hits(), 2);
        assert_eq!(sev.hit(0).value(), 5);
        assert_eq!(sev.hit(0).cluster(), Some(0));
        assert_eq!(sev.cluster(0).hits(), &[0, 1][..]);
        assert_abs_diff_eq!(sev.cluster(0).col(), 10.5);
        assert_abs_diff_eq!(sev.cluster(0).col_var(), 0.25);

        // tracks with their cluster references and back-links
        assert_eq!(event.num_tracks(), 1);
        let track = event.track(0);
        assert_abs_diff_eq!(track.chi2(), 1.5);
        assert_eq!(track.degrees_of_freedom(), 2);
        assert_eq!(track.get_cluster_on(1), Some(0));
        assert_eq!(event.sensor_event(1).cluster(0).track(), Some(0));
        assert_abs_diff_eq!(track.global_state().loc0(), 0.1);
        assert_abs_diff_eq!(track.global_state().cov()[(0, 0)], 1e-4);

        // local states
        let state = event.sensor_event(0).local_state(0).unwrap();
        assert_abs_diff_eq!(state.loc0(), 0.3);
        assert_abs_diff_eq!(state.slope_loc1(), -0.06);

        // second event, then the end
        assert!(reader.read(&mut event).unwrap());
        assert!(!reader.read(&mut event).unwrap());
    }

    #[test]
    fn skip_advances_past_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.rec");

        let mut writer = RecordWriter::create(&path, 2).unwrap();
        for frame in 0..5u64 {
            let mut event = sample_event();
            event.clear(frame, 0);
            writer.append(&event).unwrap();
        }
        writer.finalize().unwrap();

        let mut reader = RecordReader::open(&path).unwrap();
        reader.skip(3).unwrap();
        let mut event = Event::new(2);
        assert!(reader.read(&mut event).unwrap());
        assert_eq!(event.frame(), 3);
        assert_eq!(reader.num_events(), Some(1));
    }

    #[test]
    fn writer_rejects_mismatched_sensor_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.rec");
        let mut writer = RecordWriter::create(&path, 3).unwrap();
        let event = Event::new(2);
        assert!(writer.append(&event).is_err());
    }

    #[test]
    fn corrupt_files_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.rec");
        std::fs::write(&path, b"definitely not a record file").unwrap();
        assert!(RecordReader::open(&path).is_err());

        let short = dir.path().join("short.rec");
        std::fs::write(&short, b"xy").unwrap();
        assert!(RecordReader::open(&short).is_err());
    }

    #[test]
    fn truncated_event_payload_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.rec");
        let mut writer = RecordWriter::create(&path, 2).unwrap();
        writer.append(&sample_event()).unwrap();
        writer.finalize().unwrap();

        // cut the file inside the first event payload
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..HEADER_LEN + 10]).unwrap();

        let mut reader = RecordReader::open(&path).unwrap();
        let mut event = Event::new(2);
        assert!(reader.read(&mut event).is_err());
    }
}
