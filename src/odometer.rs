use geo::{HaversineDistance, Point};

/// Great-circle distance covered by consecutive samples of one trip.
#[derive(Debug, Default, Clone)]
pub struct TripOdometer {
    last: Option<Point<f64>>,
    meters: f64,
}

impl TripOdometer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.last = None;
        self.meters = 0.0;
    }

    pub fn record(&mut self, latitude: f64, longitude: f64) {
        let point = Point::new(longitude, latitude);
        if let Some(prev) = self.last {
            self.meters += prev.haversine_distance(&point);
        }
        self.last = Some(point);
    }

    pub fn distance_km(&self) -> f64 {
        self.meters / 1000.0
    }
}
