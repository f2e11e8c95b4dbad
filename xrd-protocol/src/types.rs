// Copyright 2025 The xrd authors
//
// SPDX-License-Identifier: MIT

//! Shared wire types: geometry, layer entries, session states and events.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    wire::{self, Wire},
    ProtocolError,
};

/// Layers per frame submission.
pub const MAX_LAYERS: usize = 16;
/// Swapchain references per layer.
pub const MAX_SUB_IMAGES: usize = 4;

/// A rigid transform: orientation quaternion (xyzw) plus position.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct Pose {
    pub orientation: [f32; 4],
    pub position: [f32; 3],
}

impl Pose {
    pub const IDENTITY: Pose = Pose {
        orientation: [0.0, 0.0, 0.0, 1.0],
        position: [0.0, 0.0, 0.0],
    };
}

impl Default for Pose {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Wire for Pose {
    fn encode(&self, buf: &mut BytesMut) {
        for v in self.orientation {
            buf.put_f32_le(v);
        }
        for v in self.position {
            buf.put_f32_le(v);
        }
    }

    fn decode(buf: &mut Bytes) -> Result<Self, ProtocolError> {
        let mut orientation = [0.0; 4];
        for v in orientation.iter_mut() {
            *v = wire::get_f32(buf)?;
        }

        let mut position = [0.0; 3];
        for v in position.iter_mut() {
            *v = wire::get_f32(buf)?;
        }

        Ok(Self {
            orientation,
            position,
        })
    }
}

/// A sub-rectangle of a swapchain image, in pixels.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct Rect2D {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Wire for Rect2D {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.x);
        buf.put_i32_le(self.y);
        buf.put_u32_le(self.width);
        buf.put_u32_le(self.height);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, ProtocolError> {
        Ok(Self {
            x: wire::get_i32(buf)?,
            y: wire::get_i32(buf)?,
            width: wire::get_u32(buf)?,
            height: wire::get_u32(buf)?,
        })
    }
}

/// A field of view, as half-angles in radians. Left and down are negative
/// for symmetric views.
#[derive(Debug, Copy, Clone, PartialEq, Default)]
pub struct Fov {
    pub angle_left: f32,
    pub angle_right: f32,
    pub angle_up: f32,
    pub angle_down: f32,
}

impl Wire for Fov {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_f32_le(self.angle_left);
        buf.put_f32_le(self.angle_right);
        buf.put_f32_le(self.angle_up);
        buf.put_f32_le(self.angle_down);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, ProtocolError> {
        Ok(Self {
            angle_left: wire::get_f32(buf)?,
            angle_right: wire::get_f32(buf)?,
            angle_up: wire::get_f32(buf)?,
            angle_down: wire::get_f32(buf)?,
        })
    }
}

macro_rules! wire_enum {
    ($(#[$attr:meta])* $name:ident { $($num:expr => $variant:ident),*, }) => {
        $(#[$attr])*
        #[repr(u32)]
        #[derive(Debug, Copy, Clone, PartialEq, Eq)]
        pub enum $name {
            $($variant = $num),*
        }

        impl $name {
            pub fn from_u32(v: u32) -> Result<Self, ProtocolError> {
                match v {
                    $($num => Ok($name::$variant)),*,
                    _ => Err(ProtocolError::InvalidEnum(stringify!($name), v)),
                }
            }
        }

        impl Wire for $name {
            fn encode(&self, buf: &mut BytesMut) {
                buf.put_u32_le(*self as u32);
            }

            fn decode(buf: &mut Bytes) -> Result<Self, ProtocolError> {
                Self::from_u32(wire::get_u32(buf)?)
            }
        }
    };
}

wire_enum! {
    /// The composition type of a submitted layer.
    LayerType {
        0 => StereoProjection,
        1 => Quad,
        2 => Cube,
        3 => Cylinder,
        4 => Equirect,
        5 => Passthrough,
    }
}

wire_enum! {
    /// How client imagery combines with the user's environment.
    EnvBlendMode {
        0 => Opaque,
        1 => Additive,
        2 => AlphaBlend,
    }
}

wire_enum! {
    /// The visible session lifecycle states.
    SessionState {
        0 => Idle,
        1 => Ready,
        2 => Synchronized,
        3 => Visible,
        4 => Focused,
        5 => Stopping,
        6 => LossPending,
        7 => Exiting,
    }
}

/// Layer flag: the layer pose is relative to the view, not the world.
pub const LAYER_FLAG_VIEW_SPACE: u32 = 1 << 0;
/// Layer flag: source alpha blends the layer over those below it.
pub const LAYER_FLAG_BLEND_ALPHA: u32 = 1 << 1;
/// Layer flag: source color channels are premultiplied by alpha.
pub const LAYER_FLAG_PREMULTIPLIED: u32 = 1 << 2;

/// One eye's (or face's) worth of swapchain imagery within a layer.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct SubImage {
    pub swapchain_id: u64,
    pub image_rect: Rect2D,
    pub array_index: u32,
}

impl Wire for SubImage {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.swapchain_id);
        self.image_rect.encode(buf);
        buf.put_u32_le(self.array_index);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, ProtocolError> {
        Ok(Self {
            swapchain_id: wire::get_u64(buf)?,
            image_rect: Rect2D::decode(buf)?,
            array_index: wire::get_u32(buf)?,
        })
    }
}

/// One element of a frame's layer stack.
#[derive(Debug, Clone, PartialEq)]
pub struct LayerEntry {
    pub layer_type: LayerType,
    pub flags: u32,
    pub pose: Pose,
    /// 1-4 swapchain references, depending on the layer type.
    pub sub_images: Vec<SubImage>,
}

impl Wire for LayerEntry {
    fn encode(&self, buf: &mut BytesMut) {
        self.layer_type.encode(buf);
        buf.put_u32_le(self.flags);
        self.pose.encode(buf);
        wire::put_vec(buf, &self.sub_images);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, ProtocolError> {
        let layer_type = LayerType::decode(buf)?;
        let flags = wire::get_u32(buf)?;
        let pose = Pose::decode(buf)?;
        let sub_images = wire::get_vec(buf, MAX_SUB_IMAGES, "sub_images")?;

        if sub_images.is_empty() && layer_type != LayerType::Passthrough {
            return Err(ProtocolError::InvalidMessage);
        }

        Ok(Self {
            layer_type,
            flags,
            pose,
            sub_images,
        })
    }
}

/// An event queued for a client, as delivered by `poll_event`.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedEvent {
    pub timestamp_ns: u64,
    pub payload: EventPayload,
}

impl Wire for QueuedEvent {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.payload.kind());
        buf.put_u64_le(self.timestamp_ns);
        self.payload.encode_body(buf);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, ProtocolError> {
        let kind = wire::get_u32(buf)?;
        let timestamp_ns = wire::get_u64(buf)?;
        let payload = EventPayload::decode_body(kind, buf)?;

        Ok(Self {
            timestamp_ns,
            payload,
        })
    }
}

/// The body of an outbound event.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    SessionStateChanged { state: SessionState },
    OverlayVisibilityChanged { visible: bool },
    LossPending,
    Exiting,
    HapticStop { device_index: u32, output_index: u32 },
}

impl EventPayload {
    /// The low bits of the event opcode (`0xFF000000 | kind`).
    pub fn kind(&self) -> u32 {
        match self {
            EventPayload::SessionStateChanged { .. } => 1,
            EventPayload::OverlayVisibilityChanged { .. } => 2,
            EventPayload::LossPending => 3,
            EventPayload::Exiting => 4,
            EventPayload::HapticStop { .. } => 5,
        }
    }

    pub(crate) fn encode_body(&self, buf: &mut BytesMut) {
        match self {
            EventPayload::SessionStateChanged { state } => state.encode(buf),
            EventPayload::OverlayVisibilityChanged { visible } => wire::put_bool(buf, *visible),
            EventPayload::LossPending | EventPayload::Exiting => (),
            EventPayload::HapticStop {
                device_index,
                output_index,
            } => {
                buf.put_u32_le(*device_index);
                buf.put_u32_le(*output_index);
            }
        }
    }

    pub(crate) fn decode_body(kind: u32, buf: &mut Bytes) -> Result<Self, ProtocolError> {
        match kind {
            1 => Ok(EventPayload::SessionStateChanged {
                state: SessionState::decode(buf)?,
            }),
            2 => Ok(EventPayload::OverlayVisibilityChanged {
                visible: wire::get_bool(buf)?,
            }),
            3 => Ok(EventPayload::LossPending),
            4 => Ok(EventPayload::Exiting),
            5 => Ok(EventPayload::HapticStop {
                device_index: wire::get_u32(buf)?,
                output_index: wire::get_u32(buf)?,
            }),
            _ => Err(ProtocolError::InvalidEnum("EventPayload", kind)),
        }
    }
}
