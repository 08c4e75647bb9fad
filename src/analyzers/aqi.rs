/// Converts a PM2.5 concentration (µg/m³) into a US AQI value.
///
/// The concentration is truncated to one decimal and floored at zero, then
/// interpolated linearly inside its breakpoint band:
///
/// | Concentration   | AQI       |
/// |-----------------|-----------|
/// | 0.0 – 12.0      | 0 – 50    |
/// | 12.1 – 35.4     | 51 – 100  |
/// | 35.5 – 55.4     | 101 – 150 |
/// | 55.5 – 150.4    | 151 – 200 |
/// | 150.5 – 250.4   | 201 – 300 |
/// | >= 250.5        | 301 – 500 |
///
/// Concentrations above 500.4 extrapolate along the last band.
pub fn pm25_to_aqi(pm: f64) -> u16 {
    let c = ((pm * 10.0).trunc() / 10.0).max(0.0);

    let (i_low, i_high, c_low, c_high) = match c {
        c if c <= 12.0 => (0.0, 50.0, 0.0, 12.0),
        c if c <= 35.4 => (51.0, 100.0, 12.1, 35.4),
        c if c <= 55.4 => (101.0, 150.0, 35.5, 55.4),
        c if c <= 150.4 => (151.0, 200.0, 55.5, 150.4),
        c if c <= 250.4 => (201.0, 300.0, 150.5, 250.4),
        _ => (301.0, 500.0, 250.5, 500.4),
    };

    let aqi = (i_high - i_low) / (c_high - c_low) * (c - c_low) + i_low;
    aqi.round().clamp(0.0, u16::MAX as f64) as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aqi_band_edges() {
        assert_eq!(pm25_to_aqi(0.0), 0);
        assert_eq!(pm25_to_aqi(12.0), 50);
        assert_eq!(pm25_to_aqi(12.1), 51);
        assert_eq!(pm25_to_aqi(35.4), 100);
        assert_eq!(pm25_to_aqi(35.5), 101);
        assert_eq!(pm25_to_aqi(55.4), 150);
        assert_eq!(pm25_to_aqi(150.4), 200);
        assert_eq!(pm25_to_aqi(250.4), 300);
        assert_eq!(pm25_to_aqi(500.4), 500);
    }

    #[test]
    fn test_aqi_truncates_and_floors() {
        assert_eq!(pm25_to_aqi(12.09), 50);
        assert_eq!(pm25_to_aqi(-3.0), 0);
    }

    #[test]
    fn test_aqi_extrapolates_past_table() {
        assert!(pm25_to_aqi(600.0) > 500);
    }
}
