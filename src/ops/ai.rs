// ============================================================================
// EDIT GENERATION: contract with the remote generative model
// ============================================================================
//
// Pixel edits such as inpainting, background removal and generated
// backgrounds are produced by an external model. This module only defines
// the request/response contract; transport lives with the caller.

use egui::Pos2;

use crate::canvas::RasterImage;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum GenerateError {
    /// The request was refused by the model's content policy.
    #[error("request blocked: {0}")]
    Blocked(String),

    /// The model answered without an image.
    #[error("the model returned no image")]
    NoImage,

    /// Transport or any other failure.
    #[error("{0}")]
    Other(String),
}

/// Where the edit applies.
#[derive(Clone, Debug, PartialEq)]
pub enum EditTarget {
    /// Full-resolution black/white mask; white marks the region.
    Mask(RasterImage),
    /// A single point in natural image pixels.
    Hotspot(Pos2),
    /// No locality (background removal, global adjustments).
    WholeImage,
}

impl EditTarget {
    /// Pick the target for a localized edit. A mask wins over a hotspot;
    /// with neither there is nothing to send.
    pub fn choose(mask: Option<RasterImage>, hotspot: Option<Pos2>) -> Option<Self> {
        match (mask, hotspot) {
            (Some(mask), _) => Some(EditTarget::Mask(mask)),
            (None, Some(point)) => Some(EditTarget::Hotspot(point)),
            (None, None) => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            EditTarget::Mask(_) => "mask",
            EditTarget::Hotspot(_) => "hotspot",
            EditTarget::WholeImage => "whole",
        }
    }
}

#[derive(Clone, Debug)]
pub struct EditRequest {
    pub image: RasterImage,
    pub instruction: String,
    pub target: EditTarget,
}

/// The remote model. Implementations block until the model answers.
pub trait EditGenerator {
    fn edit(&self, request: &EditRequest) -> Result<RasterImage, GenerateError>;
}

impl<F> EditGenerator for F
where
    F: Fn(&EditRequest) -> Result<RasterImage, GenerateError>,
{
    fn edit(&self, request: &EditRequest) -> Result<RasterImage, GenerateError> {
        self(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[test]
    fn mask_takes_precedence_over_hotspot() {
        let mask = RasterImage::filled(2, 2, Rgba([255, 255, 255, 255]));
        let chosen = EditTarget::choose(Some(mask.clone()), Some(Pos2::new(1.0, 1.0)));
        assert_eq!(chosen, Some(EditTarget::Mask(mask)));
        assert_eq!(
            EditTarget::choose(None, Some(Pos2::new(3.0, 4.0))),
            Some(EditTarget::Hotspot(Pos2::new(3.0, 4.0)))
        );
        assert_eq!(EditTarget::choose(None, None), None);
    }

    #[test]
    fn closures_act_as_generators() {
        let generator = |req: &EditRequest| -> Result<RasterImage, GenerateError> {
            if req.instruction.is_empty() {
                Err(GenerateError::Blocked("empty prompt".into()))
            } else {
                Ok(req.image.clone())
            }
        };
        let request = EditRequest {
            image: RasterImage::filled(1, 1, Rgba([0, 0, 0, 255])),
            instruction: String::new(),
            target: EditTarget::WholeImage,
        };
        assert!(matches!(generator.edit(&request), Err(GenerateError::Blocked(_))));
    }
}
