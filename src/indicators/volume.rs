use crate::models::VolumeSignal;

/// Mean of the last `period` volumes
pub fn calculate_average_volume(volumes: &[f64], period: usize) -> Option<f64> {
    if period == 0 || volumes.len() < period {
        return None;
    }
    Some(volumes.iter().rev().take(period).sum::<f64>() / period as f64)
}

/// `Go` when the latest volume beats the recent average
pub fn volume_signal(current_volume: f64, avg_volume: f64) -> VolumeSignal {
    if current_volume > avg_volume {
        VolumeSignal::Go
    } else {
        VolumeSignal::Wait
    }
}
