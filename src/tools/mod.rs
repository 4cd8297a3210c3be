pub mod chat;
pub mod enums;
pub mod image;
pub mod listproviders;
pub mod speak;

/// Largest width or height accepted by `generate_image`.
pub const MAX_IMAGE_DIMENSION: u32 = 4096;

/// Validate temperature is within the range every chat backend accepts.
pub fn validate_temperature(temp: Option<f64>) -> Result<(), String> {
    if let Some(t) = temp
        && (t.is_nan() || t.is_infinite() || !(0.0..=2.0).contains(&t))
    {
        return Err(format!("temperature must be between 0.0 and 2.0, got {t}"));
    }
    Ok(())
}

/// Validate prompt is non-empty.
pub fn validate_prompt(prompt: &str) -> Result<(), String> {
    if prompt.trim().is_empty() {
        return Err("prompt must not be empty".to_string());
    }
    Ok(())
}

pub fn validate_dimension(name: &str, value: Option<u32>) -> Result<(), String> {
    if let Some(v) = value
        && (v == 0 || v > MAX_IMAGE_DIMENSION)
    {
        return Err(format!("{name} must be between 1 and {MAX_IMAGE_DIMENSION}, got {v}"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn temperature_bounds() {
        assert!(validate_temperature(None).is_ok());
        assert!(validate_temperature(Some(0.0)).is_ok());
        assert!(validate_temperature(Some(2.0)).is_ok());
        assert!(validate_temperature(Some(2.1)).is_err());
        assert!(validate_temperature(Some(-0.1)).is_err());
        assert!(validate_temperature(Some(f64::NAN)).is_err());
        assert!(validate_temperature(Some(f64::INFINITY)).is_err());
    }

    #[test]
    fn prompt_must_have_content() {
        assert!(validate_prompt("hi").is_ok());
        assert_eq!(validate_prompt("  \n").unwrap_err(), "prompt must not be empty");
    }

    #[test]
    fn dimension_bounds() {
        assert!(validate_dimension("width", None).is_ok());
        assert!(validate_dimension("width", Some(1024)).is_ok());
        assert!(validate_dimension("width", Some(0)).is_err());
        assert!(validate_dimension("height", Some(8192)).unwrap_err().contains("height"));
    }
}
