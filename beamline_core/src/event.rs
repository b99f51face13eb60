//! Per-event storage: hits, clusters, track states, and tracks.
//!
//! The `Event` owns one `SensorEvent` per sensor and the list of global
//! tracks; sensor events own their hits and clusters. All cross-references
//! between objects are indices local to the owning container, never
//! pointers, and the `add_*` operations are the only way to create them so
//! that the back-links stay consistent.

use std::collections::BTreeMap;

use nalgebra::{Matrix2, Matrix4, Matrix6, Vector2, Vector4, Vector6};

/// Parameter indices of a track state vector.
pub mod track_params {
    pub const LOC0: usize = 0;
    pub const LOC1: usize = 1;
    pub const TIME: usize = 2;
    pub const SLOPE_LOC0: usize = 3;
    pub const SLOPE_LOC1: usize = 4;
    pub const SLOPE_TIME: usize = 5;
}

// spatial parameters in packed covariance order
const SPATIAL: [usize; 4] = [
    track_params::LOC0,
    track_params::LOC1,
    track_params::SLOPE_LOC0,
    track_params::SLOPE_LOC1,
];

/// A sensor hit identified by its address, timestamp, and value.
///
/// Devices where the recorded readout address differs from the physical
/// pixel address keep both; the digital address is what came off the wire
/// and the physical address is what clustering uses.
#[derive(Debug, Clone)]
pub struct Hit {
    digital_col: i32,
    digital_row: i32,
    col: i32,
    row: i32,
    timestamp: i32,
    value: i32,
    region: Option<usize>,
    cluster: Option<usize>,
}

impl Hit {
    pub fn new(col: i32, row: i32, timestamp: i32, value: i32) -> Self {
        Self {
            digital_col: col,
            digital_row: row,
            col,
            row,
            timestamp,
            value,
            region: None,
            cluster: None,
        }
    }

    /// Set only the physical address, leaving the digital address untouched.
    pub fn set_physical_address(&mut self, col: i32, row: i32) {
        self.col = col;
        self.row = row;
    }

    pub fn set_region(&mut self, region: usize) {
        self.region = Some(region);
    }

    pub fn digital_col(&self) -> i32 {
        self.digital_col
    }

    pub fn digital_row(&self) -> i32 {
        self.digital_row
    }

    pub fn col(&self) -> i32 {
        self.col
    }

    pub fn row(&self) -> i32 {
        self.row
    }

    pub fn timestamp(&self) -> i32 {
        self.timestamp
    }

    pub fn value(&self) -> i32 {
        self.value
    }

    pub fn region(&self) -> Option<usize> {
        self.region
    }

    /// The cluster this hit belongs to, if any.
    pub fn cluster(&self) -> Option<usize> {
        self.cluster
    }
}

/// A group of adjacent hits attributed to a single particle crossing.
///
/// Pixel-coordinate centroid and spread are stored together with the
/// derived local and global positions. The position fields are NaN until
/// the cluster has been transformed with the sensor geometry.
#[derive(Debug, Clone)]
pub struct Cluster {
    col: f64,
    row: f64,
    col_var: f64,
    row_var: f64,
    col_row_cov: f64,
    timestamp: f64,
    timestamp_var: f64,
    value: f64,
    region: Option<usize>,
    pos_local: Vector4<f64>,
    cov_local: Matrix4<f64>,
    pos_global: Vector4<f64>,
    cov_global: Matrix4<f64>,
    hits: Vec<usize>,
    track: Option<usize>,
    matched_state: Option<usize>,
}

impl Cluster {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        col: f64,
        row: f64,
        timestamp: f64,
        value: f64,
        col_var: f64,
        row_var: f64,
        col_row_cov: f64,
        timestamp_var: f64,
    ) -> Self {
        Self {
            col,
            row,
            col_var,
            row_var,
            col_row_cov,
            timestamp,
            timestamp_var,
            value,
            region: None,
            pos_local: Vector4::repeat(f64::NAN),
            cov_local: Matrix4::repeat(f64::NAN),
            pos_global: Vector4::repeat(f64::NAN),
            cov_global: Matrix4::repeat(f64::NAN),
            hits: Vec::new(),
            track: None,
            matched_state: None,
        }
    }

    pub fn set_region(&mut self, region: usize) {
        self.region = Some(region);
    }

    /// Store the derived local-plane position and covariance.
    pub fn set_local(&mut self, pos: Vector4<f64>, cov: Matrix4<f64>) {
        self.pos_local = pos;
        self.cov_local = cov;
    }

    /// Store the derived global position and covariance.
    pub fn set_global(&mut self, pos: Vector4<f64>, cov: Matrix4<f64>) {
        self.pos_global = pos;
        self.cov_global = cov;
    }

    pub fn col(&self) -> f64 {
        self.col
    }

    pub fn row(&self) -> f64 {
        self.row
    }

    pub fn col_var(&self) -> f64 {
        self.col_var
    }

    pub fn row_var(&self) -> f64 {
        self.row_var
    }

    pub fn col_row_cov(&self) -> f64 {
        self.col_row_cov
    }

    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    pub fn timestamp_var(&self) -> f64 {
        self.timestamp_var
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    pub fn region(&self) -> Option<usize> {
        self.region
    }

    /// Local u coordinate.
    pub fn u(&self) -> f64 {
        self.pos_local[0]
    }

    /// Local v coordinate.
    pub fn v(&self) -> f64 {
        self.pos_local[1]
    }

    /// Local time coordinate.
    pub fn s(&self) -> f64 {
        self.pos_local[3]
    }

    pub fn position_local(&self) -> &Vector4<f64> {
        &self.pos_local
    }

    pub fn cov_local(&self) -> &Matrix4<f64> {
        &self.cov_local
    }

    /// In-plane (u, v) covariance block.
    pub fn uv_cov(&self) -> Matrix2<f64> {
        self.cov_local.fixed_view::<2, 2>(0, 0).into_owned()
    }

    pub fn position_global(&self) -> &Vector4<f64> {
        &self.pos_global
    }

    pub fn cov_global(&self) -> &Matrix4<f64> {
        &self.cov_global
    }

    /// Transverse (x, y) covariance block in the global frame.
    pub fn xy_cov(&self) -> Matrix2<f64> {
        self.cov_global.fixed_view::<2, 2>(0, 0).into_owned()
    }

    pub fn size(&self) -> usize {
        self.hits.len()
    }

    pub fn hits(&self) -> &[usize] {
        &self.hits
    }

    pub fn is_in_track(&self) -> bool {
        self.track.is_some()
    }

    pub fn track(&self) -> Option<usize> {
        self.track
    }

    pub fn is_matched(&self) -> bool {
        self.matched_state.is_some()
    }

    pub fn matched_state(&self) -> Option<usize> {
        self.matched_state
    }

    fn set_track(&mut self, track: usize) {
        assert!(self.track.is_none(), "cluster can only be in one track");
        self.track = Some(track);
    }
}

/// Track state on a plane: six parameters and their covariance.
///
/// On the global xy-plane the parameters coincide with the usual global
/// description, i.e. transverse position and slopes along z.
#[derive(Debug, Clone)]
pub struct TrackState {
    params: Vector6<f64>,
    cov: Matrix6<f64>,
    matched_cluster: Option<usize>,
}

impl TrackState {
    /// Construct from spatial parameters with zero time components.
    pub fn new(loc0: f64, loc1: f64, slope_loc0: f64, slope_loc1: f64) -> Self {
        let mut params = Vector6::zeros();
        params[track_params::LOC0] = loc0;
        params[track_params::LOC1] = loc1;
        params[track_params::SLOPE_LOC0] = slope_loc0;
        params[track_params::SLOPE_LOC1] = slope_loc1;
        Self {
            params,
            cov: Matrix6::zeros(),
            matched_cluster: None,
        }
    }

    /// Construct from a full parameter vector and covariance.
    pub fn from_parts(params: Vector6<f64>, cov: Matrix6<f64>) -> Self {
        Self {
            params,
            cov,
            matched_cluster: None,
        }
    }

    /// Set offset/slope variances and their covariance for the u direction.
    pub fn set_cov_u(&mut self, var_offset: f64, var_slope: f64, cov: f64) {
        use track_params::{LOC0, SLOPE_LOC0};
        self.cov[(LOC0, LOC0)] = var_offset;
        self.cov[(SLOPE_LOC0, SLOPE_LOC0)] = var_slope;
        self.cov[(LOC0, SLOPE_LOC0)] = cov;
        self.cov[(SLOPE_LOC0, LOC0)] = cov;
    }

    /// Set offset/slope variances and their covariance for the v direction.
    pub fn set_cov_v(&mut self, var_offset: f64, var_slope: f64, cov: f64) {
        use track_params::{LOC1, SLOPE_LOC1};
        self.cov[(LOC1, LOC1)] = var_offset;
        self.cov[(SLOPE_LOC1, SLOPE_LOC1)] = var_slope;
        self.cov[(LOC1, SLOPE_LOC1)] = cov;
        self.cov[(SLOPE_LOC1, LOC1)] = cov;
    }

    pub fn params(&self) -> &Vector6<f64> {
        &self.params
    }

    pub fn cov(&self) -> &Matrix6<f64> {
        &self.cov
    }

    pub fn loc0(&self) -> f64 {
        self.params[track_params::LOC0]
    }

    pub fn loc1(&self) -> f64 {
        self.params[track_params::LOC1]
    }

    pub fn time(&self) -> f64 {
        self.params[track_params::TIME]
    }

    pub fn slope_loc0(&self) -> f64 {
        self.params[track_params::SLOPE_LOC0]
    }

    pub fn slope_loc1(&self) -> f64 {
        self.params[track_params::SLOPE_LOC1]
    }

    pub fn slope_time(&self) -> f64 {
        self.params[track_params::SLOPE_TIME]
    }

    /// On-plane spatial location (loc0, loc1).
    pub fn location(&self) -> Vector2<f64> {
        Vector2::new(self.loc0(), self.loc1())
    }

    /// Covariance of the on-plane location.
    pub fn location_cov(&self) -> Matrix2<f64> {
        self.cov.fixed_view::<2, 2>(0, 0).into_owned()
    }

    /// Spatial slope (dloc0/dw, dloc1/dw).
    pub fn slope(&self) -> Vector2<f64> {
        Vector2::new(self.slope_loc0(), self.slope_loc1())
    }

    /// Full position on the plane as (u, v, w = 0, s).
    pub fn position(&self) -> Vector4<f64> {
        Vector4::new(self.loc0(), self.loc1(), 0.0, self.time())
    }

    /// Full tangent in slope parametrization as (u', v', 1, s').
    pub fn tangent(&self) -> Vector4<f64> {
        Vector4::new(self.slope_loc0(), self.slope_loc1(), 1.0, self.slope_time())
    }

    pub fn is_matched(&self) -> bool {
        self.matched_cluster.is_some()
    }

    pub fn matched_cluster(&self) -> Option<usize> {
        self.matched_cluster
    }

    /// Pack the spatial covariance block into lower-triangular column-major
    /// storage for [loc0, loc1, slope0, slope1]:
    ///
    /// ```text
    /// | c[0]                |
    /// | c[1] c[4]           |
    /// | c[2] c[5] c[7]      |
    /// | c[3] c[6] c[8] c[9] |
    /// ```
    pub fn spatial_cov_packed(&self) -> [f64; 10] {
        let mut packed = [0.0; 10];
        let mut k = 0;
        for j in 0..4 {
            for i in j..4 {
                packed[k] = self.cov[(SPATIAL[i], SPATIAL[j])];
                k += 1;
            }
        }
        packed
    }

    /// Restore the spatial covariance block from packed storage.
    pub fn set_spatial_cov_packed(&mut self, packed: &[f64; 10]) {
        let mut k = 0;
        for j in 0..4 {
            for i in j..4 {
                self.cov[(SPATIAL[i], SPATIAL[j])] = packed[k];
                self.cov[(SPATIAL[j], SPATIAL[i])] = packed[k];
                k += 1;
            }
        }
    }
}

/// A particle track: global state, goodness of fit, and its clusters.
///
/// Clusters are referenced as (sensor id, cluster index) pairs with at
/// most one cluster per sensor.
#[derive(Debug, Clone, Default)]
pub struct Track {
    state: Option<TrackState>,
    chi2: f64,
    dof: i32,
    clusters: Vec<(usize, usize)>,
}

impl Track {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a cluster reference, replacing any previous one on that sensor.
    ///
    /// The referenced cluster is not informed; the back-link is written
    /// when the track is added to the event.
    pub fn add_cluster(&mut self, sensor: usize, cluster: usize) {
        if let Some(entry) = self.clusters.iter_mut().find(|(s, _)| *s == sensor) {
            entry.1 = cluster;
        } else {
            self.clusters.push((sensor, cluster));
        }
    }

    pub fn size(&self) -> usize {
        self.clusters.len()
    }

    pub fn clusters(&self) -> &[(usize, usize)] {
        &self.clusters
    }

    pub fn has_cluster_on(&self, sensor: usize) -> bool {
        self.clusters.iter().any(|(s, _)| *s == sensor)
    }

    pub fn get_cluster_on(&self, sensor: usize) -> Option<usize> {
        self.clusters
            .iter()
            .find(|(s, _)| *s == sensor)
            .map(|(_, c)| *c)
    }

    pub fn set_global_state(&mut self, state: TrackState) {
        self.state = Some(state);
    }

    /// The fitted global state; only available after a fit.
    pub fn global_state(&self) -> &TrackState {
        self.state.as_ref().expect("track has no fitted state")
    }

    pub fn has_global_state(&self) -> bool {
        self.state.is_some()
    }

    pub fn set_goodness_of_fit(&mut self, chi2: f64, dof: i32) {
        self.chi2 = chi2;
        self.dof = dof;
    }

    pub fn chi2(&self) -> f64 {
        self.chi2
    }

    pub fn degrees_of_freedom(&self) -> i32 {
        self.dof
    }

    pub fn reduced_chi2(&self) -> f64 {
        self.chi2 / self.dof as f64
    }
}

/// Hits, clusters, and local track states of one sensor in one event.
///
/// The container is reused between events; `clear` drops the content but
/// keeps the allocated capacity.
#[derive(Debug, Clone, Default)]
pub struct SensorEvent {
    frame: u64,
    timestamp: u64,
    hits: Vec<Hit>,
    clusters: Vec<Cluster>,
    local_states: BTreeMap<usize, TrackState>,
}

impl SensorEvent {
    pub fn clear(&mut self, frame: u64, timestamp: u64) {
        self.frame = frame;
        self.timestamp = timestamp;
        self.hits.clear();
        self.clusters.clear();
        self.local_states.clear();
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn add_hit(&mut self, col: i32, row: i32, timestamp: i32, value: i32) -> usize {
        self.hits.push(Hit::new(col, row, timestamp, value));
        self.hits.len() - 1
    }

    pub fn num_hits(&self) -> usize {
        self.hits.len()
    }

    pub fn hit(&self, i: usize) -> &Hit {
        &self.hits[i]
    }

    pub fn hit_mut(&mut self, i: usize) -> &mut Hit {
        &mut self.hits[i]
    }

    pub fn hits(&self) -> &[Hit] {
        &self.hits
    }

    /// Remove hits not satisfying the predicate, e.g. masked addresses.
    ///
    /// Must only be called before clustering; existing cluster references
    /// would be invalidated.
    pub fn retain_hits(&mut self, keep: impl FnMut(&Hit) -> bool) {
        assert!(
            self.clusters.is_empty(),
            "hits can only be filtered before clustering"
        );
        self.hits.retain(keep);
    }

    pub fn add_cluster(&mut self, cluster: Cluster) -> usize {
        self.clusters.push(cluster);
        self.clusters.len() - 1
    }

    pub fn num_clusters(&self) -> usize {
        self.clusters.len()
    }

    pub fn cluster(&self, i: usize) -> &Cluster {
        &self.clusters[i]
    }

    pub fn cluster_mut(&mut self, i: usize) -> &mut Cluster {
        &mut self.clusters[i]
    }

    pub fn clusters(&self) -> &[Cluster] {
        &self.clusters
    }

    /// Attach a hit to a cluster and write the hit's back-link.
    pub fn add_cluster_hit(&mut self, icluster: usize, ihit: usize) {
        let hit = &mut self.hits[ihit];
        assert!(hit.cluster.is_none(), "hit can only be in one cluster");
        hit.cluster = Some(icluster);
        self.clusters[icluster].hits.push(ihit);
    }

    /// Store the local track state for the given track index.
    pub fn set_local_state(&mut self, itrack: usize, state: TrackState) {
        self.local_states.insert(itrack, state);
    }

    pub fn has_local_state(&self, itrack: usize) -> bool {
        self.local_states.contains_key(&itrack)
    }

    pub fn local_state(&self, itrack: usize) -> Option<&TrackState> {
        self.local_states.get(&itrack)
    }

    pub fn num_local_states(&self) -> usize {
        self.local_states.len()
    }

    /// Local states ordered by track index.
    pub fn local_states(&self) -> impl Iterator<Item = (usize, &TrackState)> {
        self.local_states.iter().map(|(k, v)| (*k, v))
    }

    /// Match a cluster and a local state, writing both back-links.
    pub fn add_match(&mut self, icluster: usize, itrack: usize) {
        let state = self
            .local_states
            .get_mut(&itrack)
            .expect("cannot match track without a local state");
        assert!(state.matched_cluster.is_none(), "state is already matched");
        let cluster = &mut self.clusters[icluster];
        assert!(cluster.matched_state.is_none(), "cluster is already matched");
        state.matched_cluster = Some(icluster);
        cluster.matched_state = Some(itrack);
    }

    fn set_cluster_track(&mut self, icluster: usize, itrack: usize) {
        self.clusters[icluster].set_track(itrack);
    }
}

/// One full telescope event: trigger information, per-sensor content, and
/// reconstructed tracks.
#[derive(Debug, Clone)]
pub struct Event {
    frame: u64,
    timestamp: u64,
    trigger_time: u64,
    trigger_offset: i32,
    trigger_info: i32,
    trigger_phase: i32,
    invalid: bool,
    sensors: Vec<SensorEvent>,
    tracks: Vec<Track>,
}

impl Event {
    pub fn new(num_sensors: usize) -> Self {
        Self {
            frame: 0,
            timestamp: 0,
            trigger_time: 0,
            trigger_offset: 0,
            trigger_info: 0,
            trigger_phase: -1,
            invalid: false,
            sensors: vec![SensorEvent::default(); num_sensors],
            tracks: Vec::new(),
        }
    }

    /// Reset the event and all its sensor events for reuse.
    pub fn clear(&mut self, frame: u64, timestamp: u64) {
        self.frame = frame;
        self.timestamp = timestamp;
        self.trigger_time = 0;
        self.trigger_offset = 0;
        self.trigger_info = 0;
        self.trigger_phase = -1;
        self.invalid = false;
        for sensor in self.sensors.iter_mut() {
            sensor.clear(frame, timestamp);
        }
        self.tracks.clear();
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn set_trigger(&mut self, time: u64, offset: i32, info: i32, phase: i32) {
        self.trigger_time = time;
        self.trigger_offset = offset;
        self.trigger_info = info;
        self.trigger_phase = phase;
    }

    pub fn trigger_time(&self) -> u64 {
        self.trigger_time
    }

    pub fn trigger_offset(&self) -> i32 {
        self.trigger_offset
    }

    pub fn trigger_info(&self) -> i32 {
        self.trigger_info
    }

    pub fn trigger_phase(&self) -> i32 {
        self.trigger_phase
    }

    pub fn set_invalid(&mut self, invalid: bool) {
        self.invalid = invalid;
    }

    pub fn invalid(&self) -> bool {
        self.invalid
    }

    pub fn num_sensor_events(&self) -> usize {
        self.sensors.len()
    }

    pub fn sensor_event(&self, sensor_id: usize) -> &SensorEvent {
        &self.sensors[sensor_id]
    }

    pub fn sensor_event_mut(&mut self, sensor_id: usize) -> &mut SensorEvent {
        &mut self.sensors[sensor_id]
    }

    /// Add a reconstructed track and write the back-link on each of its
    /// clusters.
    pub fn add_track(&mut self, track: Track) -> usize {
        let itrack = self.tracks.len();
        for &(sensor, cluster) in track.clusters() {
            self.sensors[sensor].set_cluster_track(cluster, itrack);
        }
        self.tracks.push(track);
        itrack
    }

    pub fn num_tracks(&self) -> usize {
        self.tracks.len()
    }

    pub fn track(&self, i: usize) -> &Track {
        &self.tracks[i]
    }

    pub fn track_mut(&mut self, i: usize) -> &mut Track {
        &mut self.tracks[i]
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_hit_back_links() {
        let mut sev = SensorEvent::default();
        let h0 = sev.add_hit(10, 10, 0, 1);
        let h1 = sev.add_hit(11, 10, 0, 1);
        let c = sev.add_cluster(Cluster::new(10.5, 10.0, 0.0, 2.0, 0.25, 1.0 / 12.0, 0.0, 0.0));
        sev.add_cluster_hit(c, h0);
        sev.add_cluster_hit(c, h1);

        assert_eq!(sev.cluster(c).size(), 2);
        for &ihit in sev.cluster(c).hits() {
            assert_eq!(sev.hit(ihit).cluster(), Some(c));
        }
    }

    #[test]
    #[should_panic(expected = "one cluster")]
    fn hit_cannot_join_two_clusters() {
        let mut sev = SensorEvent::default();
        let h = sev.add_hit(1, 1, 0, 1);
        let c0 = sev.add_cluster(Cluster::new(1.0, 1.0, 0.0, 1.0, 0.1, 0.1, 0.0, 0.0));
        let c1 = sev.add_cluster(Cluster::new(1.0, 1.0, 0.0, 1.0, 0.1, 0.1, 0.0, 0.0));
        sev.add_cluster_hit(c0, h);
        sev.add_cluster_hit(c1, h);
    }

    #[test]
    fn add_track_writes_cluster_back_links() {
        let mut event = Event::new(2);
        let c0 = event
            .sensor_event_mut(0)
            .add_cluster(Cluster::new(0.0, 0.0, 0.0, 1.0, 0.1, 0.1, 0.0, 0.0));
        let c1 = event
            .sensor_event_mut(1)
            .add_cluster(Cluster::new(0.0, 0.0, 0.0, 1.0, 0.1, 0.1, 0.0, 0.0));

        let mut track = Track::new();
        track.add_cluster(0, c0);
        track.add_cluster(1, c1);
        let itrack = event.add_track(track);

        assert_eq!(event.sensor_event(0).cluster(c0).track(), Some(itrack));
        assert_eq!(event.sensor_event(1).cluster(c1).track(), Some(itrack));
    }

    #[test]
    #[should_panic(expected = "one track")]
    fn cluster_cannot_join_two_tracks() {
        let mut event = Event::new(1);
        let c = event
            .sensor_event_mut(0)
            .add_cluster(Cluster::new(0.0, 0.0, 0.0, 1.0, 0.1, 0.1, 0.0, 0.0));
        let mut t0 = Track::new();
        t0.add_cluster(0, c);
        let mut t1 = Track::new();
        t1.add_cluster(0, c);
        event.add_track(t0);
        event.add_track(t1);
    }

    #[test]
    fn track_replaces_cluster_on_same_sensor() {
        let mut track = Track::new();
        track.add_cluster(3, 0);
        track.add_cluster(3, 7);
        assert_eq!(track.size(), 1);
        assert_eq!(track.get_cluster_on(3), Some(7));
    }

    #[test]
    fn match_links_cluster_and_state() {
        let mut sev = SensorEvent::default();
        let c = sev.add_cluster(Cluster::new(0.0, 0.0, 0.0, 1.0, 0.1, 0.1, 0.0, 0.0));
        sev.set_local_state(4, TrackState::new(0.0, 0.0, 0.0, 0.0));
        sev.add_match(c, 4);
        assert_eq!(sev.cluster(c).matched_state(), Some(4));
        assert_eq!(sev.local_state(4).unwrap().matched_cluster(), Some(c));
    }

    #[test]
    fn clear_resets_content() {
        let mut event = Event::new(1);
        event.sensor_event_mut(0).add_hit(0, 0, 0, 1);
        let mut track = Track::new();
        track.add_cluster(0, 0);
        // add a cluster so the track reference resolves
        event
            .sensor_event_mut(0)
            .add_cluster(Cluster::new(0.0, 0.0, 0.0, 1.0, 0.1, 0.1, 0.0, 0.0));
        event.add_track(track);

        event.clear(42, 1000);
        assert_eq!(event.frame(), 42);
        assert_eq!(event.num_tracks(), 0);
        assert_eq!(event.sensor_event(0).num_hits(), 0);
        assert_eq!(event.sensor_event(0).num_clusters(), 0);
        assert_eq!(event.trigger_phase(), -1);
    }

    #[test]
    fn packed_spatial_cov_round_trip() {
        let mut state = TrackState::new(1.0, 2.0, 0.1, 0.2);
        let packed_in: [f64; 10] = [1.0, 0.1, 0.2, 0.3, 2.0, 0.4, 0.5, 3.0, 0.6, 4.0];
        state.set_spatial_cov_packed(&packed_in);
        assert_eq!(state.spatial_cov_packed(), packed_in);
        // symmetric storage
        use super::track_params::{LOC0, SLOPE_LOC1};
        assert_eq!(state.cov()[(LOC0, SLOPE_LOC1)], state.cov()[(SLOPE_LOC1, LOC0)]);
    }
}
