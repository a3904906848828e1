// Segment Priority: maps the distance to the playback position to a request priority.

/// Most urgent priority, given to segments at or behind the position.
pub const HIGHEST_PRIORITY: i32 = 0;

/// Priority of a segment starting at `segment_time`. Lower is more urgent.
///
/// The priority is the index of the first step strictly greater than the distance
/// to `position`, or the number of steps when the segment is farther than all of them.
pub fn segment_priority(segment_time: f64, position: f64, steps: &[f64]) -> i32 {
    let distance = segment_time - position;
    if distance <= 0.0 {
        return HIGHEST_PRIORITY;
    }
    steps
        .iter()
        .position(|step| distance < *step)
        .unwrap_or(steps.len()) as i32
}
