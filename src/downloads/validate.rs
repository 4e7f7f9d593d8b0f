//! Security checks on a requested download, run before any network activity.

use crate::config::schema::SourcesConfig;
use crate::error::ValidationError;
use std::path::{Component, Path};

/// Longest slice of a rejected URL echoed back in the error
const MAX_ECHOED_URL_CHARS: usize = 100;

/// Source and filename policy
#[derive(Debug, Clone)]
pub struct Validator {
    trusted_origins: Vec<String>,
    allowed_extensions: Vec<String>,
}

impl Validator {
    #[must_use]
    pub fn new(trusted_origins: Vec<String>, allowed_extensions: Vec<String>) -> Self {
        let allowed_extensions = allowed_extensions
            .into_iter()
            .map(|ext| {
                let ext = ext.to_lowercase();
                if ext.starts_with('.') {
                    ext
                } else {
                    format!(".{ext}")
                }
            })
            .collect();

        Self {
            trusted_origins,
            allowed_extensions,
        }
    }

    #[must_use]
    pub fn from_config(config: &SourcesConfig) -> Self {
        Self::new(
            config.trusted_origins.clone(),
            config.allowed_extensions.clone(),
        )
    }

    /// Check a source URL and target filename.
    ///
    /// Rules, first failure wins:
    /// 1. the URL starts with a trusted origin
    /// 2. the filename is relative and has no `..` segment
    /// 3. the filename's extension is allow-listed (case-insensitive)
    pub fn validate(&self, source_url: &str, filename: &str) -> Result<(), ValidationError> {
        if !self
            .trusted_origins
            .iter()
            .any(|origin| source_url.starts_with(origin.as_str()))
        {
            return Err(ValidationError::SourceNotAllowed {
                url: source_url.chars().take(MAX_ECHOED_URL_CHARS).collect(),
            });
        }

        if !is_safe_filename(filename) {
            return Err(ValidationError::InvalidFilename {
                filename: filename.to_string(),
            });
        }

        let extension = extension_of(filename);
        if !self.allowed_extensions.contains(&extension) {
            return Err(ValidationError::FileTypeNotAllowed {
                extension,
                allowed: self.allowed_extensions.clone(),
            });
        }

        Ok(())
    }
}

fn is_safe_filename(filename: &str) -> bool {
    if filename.is_empty() || filename.contains("..") {
        return false;
    }
    if filename.starts_with('/') || filename.starts_with('\\') {
        return false;
    }

    let path = Path::new(filename);
    !path.is_absolute()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Lowercased `.ext` of the last path component, or empty if there is none
fn extension_of(filename: &str) -> String {
    let name = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
    match name.rfind('.') {
        Some(idx) if idx > 0 => name[idx..].to_lowercase(),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator() -> Validator {
        Validator::from_config(&SourcesConfig::default())
    }

    const HF: &str = "https://huggingface.co/org/repo/resolve/main/model.safetensors";

    #[test]
    fn test_accepts_trusted_model() {
        assert!(validator().validate(HF, "model.safetensors").is_ok());
        assert!(validator()
            .validate("https://civitai.com/api/download/models/1", "lora.SAFETENSORS")
            .is_ok());
        assert!(validator()
            .validate("https://raw.githubusercontent.com/a/b/main/cfg.yaml", "sub/cfg.yaml")
            .is_ok());
    }

    #[test]
    fn test_rejects_untrusted_sources() {
        for url in [
            "https://evil.example.com/model.safetensors",
            "http://huggingface.co/model.safetensors",
            "https://huggingface.co.evil.com/model.safetensors",
            "ftp://civitai.com/model.ckpt",
            "",
        ] {
            let err = validator().validate(url, "model.safetensors").unwrap_err();
            assert!(
                matches!(err, ValidationError::SourceNotAllowed { .. }),
                "{url} should be rejected as untrusted"
            );
            assert!(err.to_string().contains("source not allowed"));
        }
    }

    #[test]
    fn test_source_echo_is_truncated() {
        let url = format!("https://evil.example.com/{}", "a".repeat(500));
        match validator().validate(&url, "model.safetensors") {
            Err(ValidationError::SourceNotAllowed { url }) => assert_eq!(url.chars().count(), 100),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_rejects_traversal_regardless_of_extension() {
        for filename in [
            "../../etc/passwd",
            "../model.safetensors",
            "a/../../model.safetensors",
            "/etc/model.safetensors",
            "/abs.ckpt",
            "\\windows\\model.bin",
            "model..safetensors",
            "",
        ] {
            let err = validator().validate(HF, filename).unwrap_err();
            assert!(
                matches!(err, ValidationError::InvalidFilename { .. }),
                "{filename:?} should be an invalid filename, got {err:?}"
            );
            assert!(err.to_string().contains("invalid filename"));
        }
    }

    #[test]
    fn test_rejects_disallowed_extensions() {
        for filename in ["model.exe", "model.safetensors.sh", "README", ".safetensors", "x.zip"] {
            let err = validator().validate(HF, filename).unwrap_err();
            assert!(
                matches!(err, ValidationError::FileTypeNotAllowed { .. }),
                "{filename} should be a disallowed type, got {err:?}"
            );
            assert!(err.to_string().contains("file type not allowed"));
        }
    }

    #[test]
    fn test_source_checked_first() {
        let err = validator()
            .validate("https://evil.example.com/x", "../x.exe")
            .unwrap_err();
        assert!(matches!(err, ValidationError::SourceNotAllowed { .. }));
    }

    #[test]
    fn test_extensions_normalised() {
        let v = Validator::new(
            vec!["https://example.org/".to_string()],
            vec!["GGUF".to_string()],
        );
        assert!(v.validate("https://example.org/m.gguf", "m.gguf").is_ok());
        assert!(v.validate("https://example.org/m.gguf", "m.safetensors").is_err());
    }

    #[test]
    fn test_extension_of() {
        assert_eq!(extension_of("model.SafeTensors"), ".safetensors");
        assert_eq!(extension_of("dir.v2/model"), "");
        assert_eq!(extension_of(".hidden"), "");
        assert_eq!(extension_of("a/b/c.pt"), ".pt");
    }
}
