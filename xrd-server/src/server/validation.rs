// Copyright 2025 The xrd authors
//
// SPDX-License-Identifier: MIT

//! Request validation helpers, shared by the handlers. Everything here
//! returns `SessionError::Validation`, which goes straight back to the
//! caller without touching the session.

use xrd_protocol::{ApplyHaptic, LayerEntry, LayerType, MAX_APP_NAME};

use crate::error::SessionError;

/// Graphics binding: headless.
pub const BINDING_HEADLESS: u32 = 0;
/// Graphics binding: vulkan, args carry the device UUID.
pub const BINDING_VULKAN: u32 = 1;

/// The only supported view configuration: primary stereo.
pub const VIEW_CONFIG_PRIMARY_STEREO: u32 = 1;

pub fn app_name(name: &str) -> Result<(), SessionError> {
    if name.is_empty() {
        return Err(SessionError::validation("empty application name"));
    }

    if name.len() > MAX_APP_NAME {
        return Err(SessionError::validation("application name too long"));
    }

    Ok(())
}

pub fn graphics_binding(binding_type: u32) -> Result<(), SessionError> {
    match binding_type {
        BINDING_HEADLESS | BINDING_VULKAN => Ok(()),
        other => Err(SessionError::validation(format!(
            "unsupported graphics binding {other}"
        ))),
    }
}

pub fn view_config(config: u32) -> Result<(), SessionError> {
    if config != VIEW_CONFIG_PRIMARY_STEREO {
        return Err(SessionError::validation(format!(
            "unsupported view configuration {config}"
        )));
    }

    Ok(())
}

/// How many swapchain references each layer type carries.
fn expected_sub_images(ty: LayerType) -> std::ops::RangeInclusive<usize> {
    match ty {
        LayerType::StereoProjection => 2..=2,
        LayerType::Quad | LayerType::Cylinder | LayerType::Equirect | LayerType::Cube => 1..=1,
        LayerType::Passthrough => 0..=0,
    }
}

pub fn haptic(m: &ApplyHaptic) -> Result<(), SessionError> {
    if m.duration_ns < 0 {
        return Err(SessionError::validation("negative haptic duration"));
    }

    if !m.amplitude.is_finite() || !(0.0..=1.0).contains(&m.amplitude) {
        return Err(SessionError::validation(format!(
            "haptic amplitude {} outside [0, 1]",
            m.amplitude
        )));
    }

    if !m.frequency_hz.is_finite() || m.frequency_hz < 0.0 {
        return Err(SessionError::validation("invalid haptic frequency"));
    }

    Ok(())
}

pub fn layer(entry: &LayerEntry) -> Result<(), SessionError> {
    let expected = expected_sub_images(entry.layer_type);
    if !expected.contains(&entry.sub_images.len()) {
        return Err(SessionError::validation(format!(
            "{:?} layer with {} swapchain references",
            entry.layer_type,
            entry.sub_images.len()
        )));
    }

    for sub in &entry.sub_images {
        if sub.image_rect.width == 0 || sub.image_rect.height == 0 {
            return Err(SessionError::validation("empty layer sub-image rect"));
        }
    }

    if !entry.pose.orientation.iter().all(|v| v.is_finite())
        || !entry.pose.position.iter().all(|v| v.is_finite())
    {
        return Err(SessionError::validation("non-finite layer pose"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use xrd_protocol::{Pose, Rect2D, SubImage};

    fn sub_image() -> SubImage {
        SubImage {
            swapchain_id: 1,
            image_rect: Rect2D {
                x: 0,
                y: 0,
                width: 16,
                height: 16,
            },
            array_index: 0,
        }
    }

    #[test]
    fn projection_needs_two_eyes() {
        let entry = LayerEntry {
            layer_type: LayerType::StereoProjection,
            flags: 0,
            pose: Pose::IDENTITY,
            sub_images: vec![sub_image()],
        };

        assert!(layer(&entry).is_err());

        let entry = LayerEntry {
            sub_images: vec![sub_image(), sub_image()],
            ..entry
        };
        assert!(layer(&entry).is_ok());
    }

    #[test]
    fn quad_needs_exactly_one() {
        let entry = LayerEntry {
            layer_type: LayerType::Quad,
            flags: 0,
            pose: Pose::IDENTITY,
            sub_images: vec![sub_image(), sub_image()],
        };

        assert!(layer(&entry).is_err());
    }

    #[test]
    fn bad_pose_rejected() {
        let entry = LayerEntry {
            layer_type: LayerType::Quad,
            flags: 0,
            pose: Pose {
                orientation: [f32::NAN, 0.0, 0.0, 1.0],
                position: [0.0; 3],
            },
            sub_images: vec![sub_image()],
        };

        assert!(layer(&entry).is_err());
    }

    #[test]
    fn haptic_bounds() {
        let ok = ApplyHaptic {
            device_index: 1,
            output_index: 0,
            duration_ns: 20_000_000,
            frequency_hz: 160.0,
            amplitude: 0.5,
        };
        assert!(haptic(&ok).is_ok());

        assert!(haptic(&ApplyHaptic {
            duration_ns: -1,
            ..ok
        })
        .is_err());
        assert!(haptic(&ApplyHaptic {
            amplitude: 1.5,
            ..ok
        })
        .is_err());
        assert!(haptic(&ApplyHaptic {
            frequency_hz: f32::NAN,
            ..ok
        })
        .is_err());
    }

    #[test]
    fn app_names() {
        assert!(app_name("hello").is_ok());
        assert!(app_name("").is_err());
        assert!(app_name(&"x".repeat(MAX_APP_NAME + 1)).is_err());
    }
}
