use geo::Point;
use itertools::Itertools;
use serde::{Serialize, Deserialize};

/// Length of one degree of latitude in metres, which is accurate enough
/// for city-scale distances. Longitude degrees are scaled by the cosine
/// of the origin's latitude.
const METERS_PER_DEGREE: f64 = 111_319.49;

/// Converts geographic (WGS84) coordinates into a locally-accurate plane
/// measured in metres, centered on a fixed origin. All map matching and
/// arclength computations happen in this plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalProjection {
    origin_latitude: f64,
    origin_longitude: f64,
    longitude_scale: f64,
}

impl LocalProjection {
    pub fn new(origin_latitude: f64, origin_longitude: f64) -> LocalProjection {
        LocalProjection {
            origin_latitude,
            origin_longitude,
            longitude_scale: origin_latitude.to_radians().cos(),
        }
    }

    pub fn project(&self, latitude: f64, longitude: f64) -> Point<f64> {
        Point::new(
            (longitude - self.origin_longitude) * METERS_PER_DEGREE * self.longitude_scale,
            (latitude - self.origin_latitude) * METERS_PER_DEGREE,
        )
    }

    /// Inverse of `project`. Returns (latitude, longitude).
    pub fn unproject(&self, point: &Point<f64>) -> (f64, f64) {
        (
            self.origin_latitude + point.y() / METERS_PER_DEGREE,
            self.origin_longitude + point.x() / (METERS_PER_DEGREE * self.longitude_scale),
        )
    }
}

/// The result of projecting a point onto a polyline: the arclength of the
/// closest point on the line, and how far away from the line the point is.
#[derive(Debug, Clone, Copy)]
pub struct Projection {
    pub distance_along: f64,
    pub distance_away: f64,
}

/// A polyline in the projected plane, with precomputed cumulative
/// arclengths per vertex. A line with fewer than two vertices is
/// considered empty and has no geometry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShapeLine {
    points: Vec<Point<f64>>,
    cumulative: Vec<f64>,
}

impl ShapeLine {
    pub fn new(points: Vec<Point<f64>>) -> ShapeLine {
        let mut cumulative = Vec::with_capacity(points.len());
        let mut total = 0.0;
        for (i, point) in points.iter().enumerate() {
            if i > 0 {
                total += distance(&points[i - 1], point);
            }
            cumulative.push(total);
        }
        ShapeLine { points, cumulative }
    }

    pub fn empty() -> ShapeLine {
        ShapeLine { points: Vec::new(), cumulative: Vec::new() }
    }

    pub fn is_empty(&self) -> bool {
        self.points.len() < 2
    }

    pub fn length(&self) -> f64 {
        *self.cumulative.last().unwrap_or(&0.0)
    }

    pub fn points(&self) -> &[Point<f64>] {
        &self.points
    }

    /// Finds the closest point of the line to `point`. Returns None for an
    /// empty line.
    pub fn project(&self, point: &Point<f64>) -> Option<Projection> {
        if self.is_empty() {
            return None;
        }
        let mut best: Option<Projection> = None;
        for (i, (a, b)) in self.points.iter().tuple_windows().enumerate() {
            let (along, away) = project_onto_segment(a, b, point);
            let candidate = Projection {
                distance_along: self.cumulative[i] + along,
                distance_away: away,
            };
            if best.map_or(true, |best| candidate.distance_away < best.distance_away) {
                best = Some(candidate);
            }
        }
        best
    }

    /// The point at arclength `distance`, clamped to the ends of the line.
    pub fn interpolate(&self, distance: f64) -> Option<Point<f64>> {
        if self.is_empty() {
            return None;
        }
        if distance <= 0.0 {
            return Some(self.points[0]);
        }
        if distance >= self.length() {
            return Some(*self.points.last().unwrap()); // non-empty line has a last point
        }
        for i in 1..self.points.len() {
            if self.cumulative[i] >= distance {
                let segment_length = self.cumulative[i] - self.cumulative[i - 1];
                if segment_length == 0.0 {
                    return Some(self.points[i]);
                }
                let t = (distance - self.cumulative[i - 1]) / segment_length;
                return Some(lerp(&self.points[i - 1], &self.points[i], t));
            }
        }
        Some(*self.points.last().unwrap()) // non-empty line has a last point
    }

    /// Cuts the line in two at arclength `distance`. The prefix ends and the
    /// suffix begins at that arclength. Degenerates to (empty, line) for
    /// distance <= 0 and to (line, empty) for distance >= length.
    pub fn cut(&self, distance: f64) -> (ShapeLine, ShapeLine) {
        if distance <= 0.0 || self.is_empty() {
            return (ShapeLine::empty(), self.clone());
        }
        if distance >= self.length() {
            return (self.clone(), ShapeLine::empty());
        }
        for i in 0..self.points.len() {
            if self.cumulative[i] == distance {
                return (
                    ShapeLine::new(self.points[..=i].to_vec()),
                    ShapeLine::new(self.points[i..].to_vec()),
                );
            }
            if self.cumulative[i] > distance {
                let cut_point = self.interpolate(distance).unwrap(); // line is non-empty here
                let mut prefix = self.points[..i].to_vec();
                prefix.push(cut_point);
                let mut suffix = vec![cut_point];
                suffix.extend_from_slice(&self.points[i..]);
                return (ShapeLine::new(prefix), ShapeLine::new(suffix));
            }
        }
        (self.clone(), ShapeLine::empty())
    }

    /// Removes all segments of the line within `radius` metres (measured by
    /// arclength around the projection of `point`) and returns what remains
    /// on either side. The split vertex is found by binary search on the
    /// cumulative arclengths.
    pub fn remove_closest_segments(&self, point: &Point<f64>, radius: f64) -> (ShapeLine, ShapeLine) {
        let (left, right, _) = self.split_around(point, radius);
        (left, right)
    }

    /// Like `remove_closest_segments`, but also reports the arclength at
    /// which the right remainder starts on this line.
    fn split_around(&self, point: &Point<f64>, radius: f64) -> (ShapeLine, ShapeLine, f64) {
        let center = match self.project(point) {
            Some(projection) => projection.distance_along,
            None => return (ShapeLine::empty(), ShapeLine::empty(), 0.0),
        };
        let max_dist_left = center - radius;
        let min_dist_right = center + radius;
        let n = self.points.len();

        let mut left = 0;
        let mut right = n - 1;
        while left != right {
            let middle = (left + right) / 2;
            if self.cumulative[middle] <= center {
                left = middle + 1;
            } else {
                right = middle;
            }
        }

        while left >= 1 && max_dist_left < self.cumulative[left - 1] {
            left -= 1;
        }
        while right < n && self.cumulative[right] < min_dist_right {
            right += 1;
        }

        let left_line = if left > 1 {
            ShapeLine::new(self.points[..left].to_vec())
        } else {
            ShapeLine::empty()
        };
        let (right_line, right_offset) = if right < n - 1 {
            (ShapeLine::new(self.points[right..].to_vec()), self.cumulative[right])
        } else {
            (ShapeLine::empty(), 0.0)
        };
        (left_line, right_line, right_offset)
    }

    /// Enumerates the arclengths of every distinct projection of `point`
    /// onto the line. When the line doubles back near the point, each pass
    /// yields its own candidate. `radius` is the arclength neighbourhood
    /// stripped between recursion steps and `threshold` is the maximum
    /// distance from the line at which a remainder is still considered.
    pub fn candidate_shape_distances(&self, point: &Point<f64>, radius: f64, threshold: f64) -> Vec<f64> {
        let mut candidates = Vec::new();
        self.collect_candidates(point, radius, threshold, 0.0, &mut candidates);
        candidates
    }

    fn collect_candidates(&self, point: &Point<f64>, radius: f64, threshold: f64, offset: f64, out: &mut Vec<f64>) {
        let projection = match self.project(point) {
            Some(projection) => projection,
            None => return,
        };
        if projection.distance_away > threshold {
            return;
        }
        out.push(offset + projection.distance_along);

        let (left, right, right_offset) = self.split_around(point, radius);
        left.collect_candidates(point, radius, threshold, offset, out);
        if !right.is_empty() {
            right.collect_candidates(point, radius, threshold, offset + right_offset, out);
        }
    }
}

fn distance(a: &Point<f64>, b: &Point<f64>) -> f64 {
    let dx = b.x() - a.x();
    let dy = b.y() - a.y();
    (dx * dx + dy * dy).sqrt()
}

fn lerp(a: &Point<f64>, b: &Point<f64>, t: f64) -> Point<f64> {
    Point::new(a.x() + (b.x() - a.x()) * t, a.y() + (b.y() - a.y()) * t)
}

/// Projects `point` onto the segment (a, b). Returns the distance along the
/// segment of the closest point, and the distance from `point` to it.
fn project_onto_segment(a: &Point<f64>, b: &Point<f64>, point: &Point<f64>) -> (f64, f64) {
    let abx = b.x() - a.x();
    let aby = b.y() - a.y();
    let segment_length_squared = abx * abx + aby * aby;
    let t = if segment_length_squared == 0.0 {
        0.0
    } else {
        let apx = point.x() - a.x();
        let apy = point.y() - a.y();
        ((apx * abx + apy * aby) / segment_length_squared).max(0.0).min(1.0)
    };
    let closest = Point::new(a.x() + abx * t, a.y() + aby * t);
    (t * segment_length_squared.sqrt(), distance(&closest, point))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn straight_line() -> ShapeLine {
        ShapeLine::new(vec![
            Point::new(0.0, 0.0),
            Point::new(100.0, 0.0),
            Point::new(200.0, 0.0),
            Point::new(300.0, 0.0),
        ])
    }

    /// A line that runs 500 m east, loops and comes back 20 m further north,
    /// so that points near it have two distinct projections.
    fn doubled_back_line() -> ShapeLine {
        ShapeLine::new(vec![
            Point::new(0.0, 0.0),
            Point::new(250.0, 0.0),
            Point::new(500.0, 0.0),
            Point::new(500.0, 20.0),
            Point::new(250.0, 20.0),
            Point::new(0.0, 20.0),
        ])
    }

    #[test]
    fn test_project_on_straight_line() {
        let line = straight_line();
        let projection = line.project(&Point::new(150.0, 30.0)).unwrap();
        assert!((projection.distance_along - 150.0).abs() < 1e-9);
        assert!((projection.distance_away - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_cut_degenerate_cases() {
        let line = straight_line();
        let (prefix, suffix) = line.cut(-5.0);
        assert!(prefix.is_empty());
        assert_eq!(suffix.points().len(), line.points().len());

        let (prefix, suffix) = line.cut(1000.0);
        assert_eq!(prefix.points().len(), line.points().len());
        assert!(suffix.is_empty());
    }

    #[test]
    fn test_cut_concatenation_reproduces_line() {
        let line = ShapeLine::new(vec![
            Point::new(0.0, 0.0),
            Point::new(30.0, 40.0),
            Point::new(90.0, 40.0),
            Point::new(90.0, 140.0),
        ]);
        for cut_at in &[10.0, 50.0, 49.9999, 110.0, 170.0] {
            let (prefix, suffix) = line.cut(*cut_at);
            assert!((prefix.length() - cut_at).abs() < 1e-9);
            assert!((prefix.length() + suffix.length() - line.length()).abs() < 1e-9);
            // prefix ends where suffix begins
            let end = prefix.points().last().unwrap();
            let start = suffix.points().first().unwrap();
            assert!((end.x() - start.x()).abs() < 1e-9);
            assert!((end.y() - start.y()).abs() < 1e-9);
            // concatenated vertices are the original ones plus the cut point
            let mut reconstructed: Vec<Point<f64>> = prefix.points().to_vec();
            reconstructed.extend_from_slice(&suffix.points()[1..]);
            for point in line.points() {
                assert!(reconstructed
                    .iter()
                    .any(|p| (p.x() - point.x()).abs() < 1e-9 && (p.y() - point.y()).abs() < 1e-9));
            }
        }
    }

    #[test]
    fn test_cut_at_vertex() {
        let line = straight_line();
        let (prefix, suffix) = line.cut(100.0);
        assert_eq!(prefix.points().len(), 2);
        assert_eq!(suffix.points().len(), 3);
        assert!((prefix.length() - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_remove_closest_segments_splits_line() {
        let line = doubled_back_line();
        // Project near the middle of the outbound leg; both remainders
        // should survive a small removal radius.
        let (left, right) = line.remove_closest_segments(&Point::new(250.0, -5.0), 10.0);
        assert!(!left.is_empty() || !right.is_empty());
        // Everything that remains must be at least radius away by arclength
        // from the projection of the point, so the right part must not
        // contain the projected position itself.
        if !right.is_empty() {
            let projection = right.project(&Point::new(250.0, -5.0)).unwrap();
            assert!(projection.distance_away >= 5.0);
        }
    }

    #[test]
    fn test_candidates_on_doubled_back_line() {
        let line = doubled_back_line();
        // A point between the two legs projects onto both of them.
        let candidates = line.candidate_shape_distances(&Point::new(250.0, 10.0), 200.0, 200.0);
        assert!(candidates.len() >= 2, "expected two passes, got {:?}", candidates);
        let min = candidates.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = candidates.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        // one candidate on the outbound leg, one on the return leg
        assert!((min - 250.0).abs() < 1.0);
        assert!((max - 770.0).abs() < 1.0);
    }

    #[test]
    fn test_candidates_far_away_point() {
        let line = straight_line();
        let candidates = line.candidate_shape_distances(&Point::new(150.0, 500.0), 200.0, 200.0);
        assert!(candidates.is_empty());
    }

    #[test]
    fn test_interpolate() {
        let line = straight_line();
        let point = line.interpolate(150.0).unwrap();
        assert!((point.x() - 150.0).abs() < 1e-9);
        assert!((point.y() - 0.0).abs() < 1e-9);
        assert_eq!(line.interpolate(-10.0).unwrap(), line.points()[0]);
        assert_eq!(line.interpolate(1e9).unwrap(), *line.points().last().unwrap());
    }

    #[test]
    fn test_projection_roundtrip() {
        let projection = LocalProjection::new(51.1, 17.03);
        let point = projection.project(51.107, 17.041);
        let (latitude, longitude) = projection.unproject(&point);
        assert!((latitude - 51.107).abs() < 1e-9);
        assert!((longitude - 17.041).abs() < 1e-9);
    }
}
