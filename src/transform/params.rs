use crate::config::Config;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Resize policy for a derivative.
///
/// `Cover` crops to exactly the requested box, `Contain` inscribes the
/// image in the box preserving aspect ratio, `ScaleDown` is `Contain`
/// without ever enlarging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Fit {
    Cover,
    #[default]
    Contain,
    ScaleDown,
}

impl fmt::Display for Fit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fit::Cover => write!(f, "cover"),
            Fit::Contain => write!(f, "contain"),
            Fit::ScaleDown => write!(f, "scale-down"),
        }
    }
}

impl FromStr for Fit {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cover" => Ok(Fit::Cover),
            "contain" => Ok(Fit::Contain),
            "scale-down" => Ok(Fit::ScaleDown),
            _ => Err(ParseError::InvalidFit),
        }
    }
}

/// Errors produced while parsing the option segment of a derivative URL.
///
/// The display texts are part of the wire contract: the fetch handler
/// embeds them verbatim in the error body.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("Invalid param: {0}")]
    InvalidParam(String),
    #[error("Width should be integer")]
    InvalidWidth,
    #[error("Height should be integer")]
    InvalidHeight,
    #[error("Quality should be integer")]
    InvalidQuality,
    #[error("Supported fits are cover, contain and scale-down")]
    InvalidFit,
    #[error("Supported formats are auto, original, webp, jpeg")]
    InvalidFormat,
    #[error("Invalid filter key: {0}")]
    UnknownKey(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("size={width}x{height} is not supported by server. Contact server admin.")]
    UnsupportedSize { width: u32, height: u32 },
    #[error("quality={0} is not supported by server. Contact server admin.")]
    UnsupportedQuality(u32),
}

/// A fully parsed derivative request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageParams {
    pub image_id: String,
    /// 0 leaves the axis unconstrained.
    pub width: u32,
    pub height: u32,
    pub fit: Fit,
    /// Seeded from the configured default; the parser also resolves an
    /// explicit `q=0` to it. A literal 0 in a hand-built value means
    /// "server default" and always passes validation.
    pub quality: u32,
    pub webp_accepted: bool,
}

/// The effective sizing handed to the codec. A zero axis is derived from
/// the other one at resize time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResizePlan {
    pub width: u32,
    pub height: u32,
    pub crop: bool,
}

impl ImageParams {
    /// Parses the comma-separated `key=value` option segment.
    ///
    /// Recognized keys: `w`/`width`, `h`/`height`, `q`/`quality`, `fit`
    /// and `f`/`format`. The format hint is folded into the webp/jpeg
    /// output decision; duplicate keys follow last-write-wins.
    pub fn parse(
        image_id: &str,
        options: &str,
        webp_accepted: bool,
        config: &Config,
    ) -> Result<ImageParams, ParseError> {
        let mut params = ImageParams {
            image_id: image_id.to_string(),
            width: 0,
            height: 0,
            fit: Fit::Contain,
            quality: config.default_image_quality,
            webp_accepted,
        };

        for item in options.split(',') {
            let mut parts = item.split('=');
            let (key, value) = match (parts.next(), parts.next(), parts.next()) {
                (Some(key), Some(value), None) => (key, value),
                _ => return Err(ParseError::InvalidParam(item.to_string())),
            };

            match key {
                "w" | "width" => {
                    params.width = value.parse().map_err(|_| ParseError::InvalidWidth)?;
                }
                "h" | "height" => {
                    params.height = value.parse().map_err(|_| ParseError::InvalidHeight)?;
                }
                "q" | "quality" => {
                    params.quality = value.parse().map_err(|_| ParseError::InvalidQuality)?;
                }
                "fit" => params.fit = value.parse()?,
                "f" | "format" => match value {
                    "auto" | "original" => {}
                    "webp" => params.webp_accepted = true,
                    "jpeg" => params.webp_accepted = false,
                    _ => return Err(ParseError::InvalidFormat),
                },
                _ => return Err(ParseError::UnknownKey(key.to_string())),
            }
        }

        // An explicit q=0 asks for the server default; resolving it here
        // keeps the fingerprint (and cache entry) shared with an
        // unqualified request and means the encoder never sees a 0.
        if params.quality == 0 {
            params.quality = config.default_image_quality;
        }

        Ok(params)
    }

    /// Cache key: 32 hex chars over the colon-joined parameter string.
    ///
    /// The serialization is an on-disk contract; changing it orphans every
    /// previously cached derivative.
    pub fn fingerprint(&self) -> String {
        let key = format!(
            "{}:{}:{}:{}:{}:{}",
            self.image_id, self.width, self.height, self.fit, self.quality, self.webp_accepted
        );
        hex::encode(md5::compute(key).0)
    }

    /// Checks the request against the configured whitelists. A request
    /// constraining neither axis skips the size check (pass-through
    /// sizing); `debug` bypasses validation entirely.
    pub fn validate(&self, config: &Config) -> Result<(), ValidationError> {
        if config.debug {
            return Ok(());
        }
        if self.width != 0 || self.height != 0 {
            let size = format!("{}x{}", self.width, self.height);
            if !config.valid_image_sizes.iter().any(|s| *s == size) {
                return Err(ValidationError::UnsupportedSize {
                    width: self.width,
                    height: self.height,
                });
            }
        }
        if self.quality != 0 {
            let in_range = (10..=100).contains(&self.quality);
            if !in_range || !config.valid_image_qualities.contains(&self.quality) {
                return Err(ValidationError::UnsupportedQuality(self.quality));
            }
        }
        Ok(())
    }

    /// Computes the effective sizing for an original of the given
    /// dimensions.
    ///
    /// For contain/scale-down with both axes requested, the constraining
    /// axis is chosen by comparing aspect ratios so the result exactly
    /// inscribes the requested box; the other axis is left at 0 for the
    /// codec to derive. Scale-down additionally clamps to the original so
    /// the derivative never upscales.
    pub fn resize_plan(&self, orig_width: u32, orig_height: u32) -> ResizePlan {
        match self.fit {
            Fit::Cover => ResizePlan {
                width: self.width,
                height: self.height,
                crop: true,
            },
            Fit::Contain | Fit::ScaleDown => {
                let (mut width, mut height) = if self.width == 0 || self.height == 0 {
                    (self.width, self.height)
                } else {
                    let image_ratio = orig_width as f32 / orig_height as f32;
                    let wanted_ratio = self.width as f32 / self.height as f32;
                    if wanted_ratio < image_ratio {
                        (self.width, 0)
                    } else {
                        (0, self.height)
                    }
                };
                if self.fit == Fit::ScaleDown {
                    if width > orig_width {
                        width = orig_width;
                    }
                    if height > orig_height {
                        height = orig_height;
                    }
                }
                ResizePlan {
                    width,
                    height,
                    crop: false,
                }
            }
        }
    }
}
