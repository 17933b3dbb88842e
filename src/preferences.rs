use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::storage::Store;

pub const DEFAULT_PRIMARY_COLOR: &str = "#007bff";

const PRIMARY_COLOR_KEY: &str = "primary_color";
const FONT_SIZE_KEY: &str = "font_size";

static HEX_COLOR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^#[0-9a-fA-F]{6}$").expect("valid hex colour regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FontSize {
    Small,
    #[default]
    Medium,
    Large,
}

impl FontSize {
    pub fn pixels(self) -> u8 {
        match self {
            FontSize::Small => 14,
            FontSize::Medium => 16,
            FontSize::Large => 18,
        }
    }

    fn key(self) -> &'static str {
        match self {
            FontSize::Small => "small",
            FontSize::Medium => "medium",
            FontSize::Large => "large",
        }
    }
}

impl fmt::Display for FontSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for FontSize {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "small" => Ok(FontSize::Small),
            "medium" => Ok(FontSize::Medium),
            "large" => Ok(FontSize::Large),
            other => bail!("preferences: unknown font size {other:?}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Theme {
    pub primary_color: String,
    pub font_size: FontSize,
}

impl Default for Theme {
    fn default() -> Self {
        Self {
            primary_color: DEFAULT_PRIMARY_COLOR.to_string(),
            font_size: FontSize::default(),
        }
    }
}

pub fn is_hex_color(value: &str) -> bool {
    HEX_COLOR.is_match(value)
}

/// Theme settings kept in the local store.
pub struct Preferences {
    store: Store,
}

impl Preferences {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Stored values that no longer parse fall back to the defaults.
    pub fn theme(&self) -> Result<Theme> {
        let mut theme = Theme::default();
        if let Some(color) = self.store.preference(PRIMARY_COLOR_KEY)? {
            if is_hex_color(&color) {
                theme.primary_color = color;
            }
        }
        if let Some(size) = self.store.preference(FONT_SIZE_KEY)? {
            theme.font_size = size.parse().unwrap_or_default();
        }
        Ok(theme)
    }

    /// Empty input leaves the colour as it was.
    pub fn set_primary_color(&self, color: &str) -> Result<()> {
        let color = color.trim();
        if color.is_empty() {
            debug!("preferences: empty colour ignored");
            return Ok(());
        }
        if !is_hex_color(color) {
            bail!("preferences: {color:?} is not a #rrggbb colour");
        }
        self.store
            .set_preference(PRIMARY_COLOR_KEY, &color.to_ascii_lowercase())
    }

    pub fn set_font_size(&self, size: FontSize) -> Result<()> {
        self.store.set_preference(FONT_SIZE_KEY, size.key())
    }

    pub fn reset(&self) -> Result<()> {
        self.store.remove_preference(PRIMARY_COLOR_KEY)?;
        self.store.remove_preference(FONT_SIZE_KEY)
    }
}
