use rmcp::ErrorData as McpError;
use serde_json::Value;

use crate::manifest::check_image_path;
use crate::pipeline::is_valid_site_id;

pub fn validate_site_id(raw: &str) -> Result<String, McpError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(McpError::invalid_params("site_id must not be empty", None));
    }
    if !is_valid_site_id(trimmed) {
        return Err(McpError::invalid_params(
            "site_id may only contain letters, digits, '-' and '_'",
            Some(Value::String(trimmed.to_string())),
        ));
    }
    Ok(trimmed.to_string())
}

pub fn validate_original_path(raw: &str) -> Result<String, McpError> {
    let trimmed = raw.trim().trim_start_matches('/');
    check_image_path(trimmed).map_err(|reason| {
        McpError::invalid_params(
            "invalid image path",
            Some(Value::String(format!("{trimmed}: {reason}"))),
        )
    })?;
    Ok(trimmed.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn site_ids_are_path_safe() {
        assert_eq!(validate_site_id(" blog ").unwrap(), "blog");
        assert!(validate_site_id("").is_err());
        assert!(validate_site_id("../other").is_err());
        assert!(validate_site_id("a/b").is_err());
    }

    #[test]
    fn original_paths_are_checked() {
        assert_eq!(
            validate_original_path("/assets/originals/a.png").unwrap(),
            "assets/originals/a.png"
        );
        assert!(validate_original_path("assets/../secret.png").is_err());
    }
}
