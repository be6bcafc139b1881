//! Expansion of a configured variant set into concrete operations.

use std::fmt;
use std::str::FromStr;

use tracing::debug;

use crate::config::{ImagerConfig, VariantSet};
use crate::error::{ImagerError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl FromStr for Dimensions {
    type Err = ImagerError;

    fn from_str(value: &str) -> Result<Self> {
        let invalid = || ImagerError::configuration(format!("invalid dimensions {value:?}, expected WxH"));
        let (width, height) = value.trim().split_once(['x', 'X']).ok_or_else(invalid)?;
        let width: u32 = width.trim().parse().map_err(|_| invalid())?;
        let height: u32 = height.trim().parse().map_err(|_| invalid())?;
        if width == 0 || height == 0 {
            return Err(invalid());
        }
        Ok(Self { width, height })
    }
}

impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum VariantKind {
    Original,
    Resize,
    Crop,
    ResizeAndCrop,
}

/// What to do to the source pixels for one preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transform {
    None,
    Resize(Dimensions),
    Crop(Dimensions),
    ResizeAndCrop { resize: Dimensions, crop: Dimensions },
}

impl Transform {
    pub fn kind(&self) -> VariantKind {
        match self {
            Self::None => VariantKind::Original,
            Self::Resize(_) => VariantKind::Resize,
            Self::Crop(_) => VariantKind::Crop,
            Self::ResizeAndCrop { .. } => VariantKind::ResizeAndCrop,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariantOperation {
    pub preset_name: String,
    pub separator: String,
    pub transform: Transform,
}

impl VariantOperation {
    pub fn kind(&self) -> VariantKind {
        self.transform.kind()
    }

    pub fn remote_name(&self, filename: &str) -> String {
        format!("{}{}{}", self.preset_name, self.separator, filename)
    }
}

/// Look up the variant set `requested` names, or the configured default.
pub fn variant_set<'a>(config: &'a ImagerConfig, requested: Option<&str>) -> Result<(&'a str, &'a VariantSet)> {
    let name = config.resolve_variant_name(requested).ok_or_else(|| {
        ImagerError::configuration("no variant given and no default variant configured")
    })?;
    config
        .variants
        .get_key_value(name)
        .map(|(name, set)| (name.as_str(), set))
        .ok_or_else(|| ImagerError::configuration(format!("unknown variant {name:?}")))
}

/// Operations for every preset of `set`, ordered original, resize, crop,
/// resize-and-crop and by preset name within a kind.
pub fn plan(set: &VariantSet) -> Result<Vec<VariantOperation>> {
    if set.preset_count() == 0 {
        return Err(ImagerError::configuration("variant defines no presets"));
    }
    let separator = set.separator().to_string();
    let operation = |preset_name: &String, transform| VariantOperation {
        preset_name: preset_name.clone(),
        separator: separator.clone(),
        transform,
    };

    let mut operations = Vec::with_capacity(set.preset_count());
    for name in set.original.keys() {
        operations.push(operation(name, Transform::None));
    }
    for (name, size) in &set.resize {
        operations.push(operation(name, Transform::Resize(size.parse()?)));
    }
    for (name, size) in &set.crop {
        operations.push(operation(name, Transform::Crop(size.parse()?)));
    }
    for (name, preset) in &set.resize_and_crop {
        operations.push(operation(
            name,
            Transform::ResizeAndCrop {
                resize: preset.resize.parse()?,
                crop: preset.crop.parse()?,
            },
        ));
    }
    debug!("Planned {} variant operations", operations.len());
    Ok(operations)
}
