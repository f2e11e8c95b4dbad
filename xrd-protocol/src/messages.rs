// Copyright 2025 The xrd authors
//
// SPDX-License-Identifier: MIT

//! Request and reply bodies, one pair per control-socket operation.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{
    types::*,
    wire::{self, Wire},
    ProtocolError,
};

/// App names longer than this are rejected outright.
pub const MAX_APP_NAME: usize = 256;
/// Graphics binding arguments are opaque to the service but bounded.
pub const MAX_BINDING_ARGS: usize = 1024;
/// Images per swapchain, wire-level bound.
pub const MAX_SWAPCHAIN_IMAGES: usize = 8;

macro_rules! empty_body {
    ($($name:ident),*,) => {
        $(
            #[derive(Debug, Clone, PartialEq, Default)]
            pub struct $name {}

            impl Wire for $name {
                fn encode(&self, _buf: &mut BytesMut) {}

                fn decode(_buf: &mut Bytes) -> Result<Self, ProtocolError> {
                    Ok(Self {})
                }
            }
        )*
    };
}

empty_body! {
    SystemGetProperties,
    ImageWaited,
    ImageReleased,
    SwapchainDestroyed,
    HapticApplied,
    SessionBegun,
    EndSession,
    SessionEnded,
    RequestExit,
    ExitRequested,
    WaitFrame,
    FrameBegun,
    FrameEnded,
    PollEvent,
}

/// Registers the calling process and hands back the shared-memory region.
/// The region's fd rides along as ancillary data on the reply.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceCreate {
    pub app_name: String,
}

impl Wire for InstanceCreate {
    fn encode(&self, buf: &mut BytesMut) {
        wire::put_string(buf, &self.app_name);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, ProtocolError> {
        Ok(Self {
            app_name: wire::get_string(buf, MAX_APP_NAME)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InstanceCreated {
    pub instance_id: u64,
    pub device_table_offset: u32,
}

impl Wire for InstanceCreated {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.instance_id);
        buf.put_u32_le(self.device_table_offset);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, ProtocolError> {
        Ok(Self {
            instance_id: wire::get_u64(buf)?,
            device_table_offset: wire::get_u32(buf)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HmdProperties {
    pub display_resolution: [u32; 2],
    pub fovs: [Fov; 2],
    pub ipd_m: f32,
}

impl Wire for HmdProperties {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.display_resolution[0]);
        buf.put_u32_le(self.display_resolution[1]);
        self.fovs[0].encode(buf);
        self.fovs[1].encode(buf);
        buf.put_f32_le(self.ipd_m);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, ProtocolError> {
        Ok(Self {
            display_resolution: [wire::get_u32(buf)?, wire::get_u32(buf)?],
            fovs: [Fov::decode(buf)?, Fov::decode(buf)?],
            ipd_m: wire::get_f32(buf)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SystemProperties {
    pub view_count: u32,
    pub view_resolution: [u32; 2],
    pub refresh_hz: f32,
    pub hmd: HmdProperties,
}

impl Wire for SystemProperties {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.view_count);
        buf.put_u32_le(self.view_resolution[0]);
        buf.put_u32_le(self.view_resolution[1]);
        buf.put_f32_le(self.refresh_hz);
        self.hmd.encode(buf);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, ProtocolError> {
        Ok(Self {
            view_count: wire::get_u32(buf)?,
            view_resolution: [wire::get_u32(buf)?, wire::get_u32(buf)?],
            refresh_hz: wire::get_f32(buf)?,
            hmd: HmdProperties::decode(buf)?,
        })
    }
}

/// Binds a graphics API to the instance. The args are opaque to the
/// service and interpreted by the renderer. Overlay sessions composite
/// atop the active primary at the given z-order.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionCreate {
    pub graphics_binding_type: u32,
    pub binding_args: Vec<u8>,
    pub overlay: bool,
    pub z_order: i32,
}

impl Wire for SessionCreate {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.graphics_binding_type);
        wire::put_byte_vec(buf, &self.binding_args);
        wire::put_bool(buf, self.overlay);
        buf.put_i32_le(self.z_order);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, ProtocolError> {
        Ok(Self {
            graphics_binding_type: wire::get_u32(buf)?,
            binding_args: wire::get_byte_vec(buf, MAX_BINDING_ARGS)?,
            overlay: wire::get_bool(buf)?,
            z_order: wire::get_i32(buf)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionCreated {
    pub session_id: u64,
}

/// Starts the frame loop for a created session.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BeginSession {
    pub primary_view_config: u32,
}

impl Wire for BeginSession {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.primary_view_config);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, ProtocolError> {
        Ok(Self {
            primary_view_config: wire::get_u32(buf)?,
        })
    }
}

impl Wire for SessionCreated {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.session_id);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, ProtocolError> {
        Ok(Self {
            session_id: wire::get_u64(buf)?,
        })
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SwapchainCreate {
    pub width: u32,
    pub height: u32,
    pub format: u32,
    pub sample_count: u32,
    pub array_size: u32,
    pub mip_count: u32,
    pub image_count: u32,
}

impl Wire for SwapchainCreate {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.width);
        buf.put_u32_le(self.height);
        buf.put_u32_le(self.format);
        buf.put_u32_le(self.sample_count);
        buf.put_u32_le(self.array_size);
        buf.put_u32_le(self.mip_count);
        buf.put_u32_le(self.image_count);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, ProtocolError> {
        Ok(Self {
            width: wire::get_u32(buf)?,
            height: wire::get_u32(buf)?,
            format: wire::get_u32(buf)?,
            sample_count: wire::get_u32(buf)?,
            array_size: wire::get_u32(buf)?,
            mip_count: wire::get_u32(buf)?,
            image_count: wire::get_u32(buf)?,
        })
    }
}

/// The image memory handles ride along as ancillary data, one per image,
/// in index order.
#[derive(Debug, Clone, PartialEq)]
pub struct SwapchainCreated {
    pub swapchain_id: u64,
    pub image_count: u32,
}

impl Wire for SwapchainCreated {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.swapchain_id);
        buf.put_u32_le(self.image_count);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, ProtocolError> {
        Ok(Self {
            swapchain_id: wire::get_u64(buf)?,
            image_count: wire::get_u32(buf)?,
        })
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SwapchainAcquire {
    pub swapchain_id: u64,
}

impl Wire for SwapchainAcquire {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.swapchain_id);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, ProtocolError> {
        Ok(Self {
            swapchain_id: wire::get_u64(buf)?,
        })
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ImageAcquired {
    pub image_index: u32,
}

impl Wire for ImageAcquired {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.image_index);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, ProtocolError> {
        Ok(Self {
            image_index: wire::get_u32(buf)?,
        })
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SwapchainWait {
    pub swapchain_id: u64,
    pub timeout_ns: i64,
}

impl Wire for SwapchainWait {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.swapchain_id);
        buf.put_i64_le(self.timeout_ns);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, ProtocolError> {
        Ok(Self {
            swapchain_id: wire::get_u64(buf)?,
            timeout_ns: wire::get_i64(buf)?,
        })
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SwapchainRelease {
    pub swapchain_id: u64,
}

impl Wire for SwapchainRelease {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.swapchain_id);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, ProtocolError> {
        Ok(Self {
            swapchain_id: wire::get_u64(buf)?,
        })
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SwapchainDestroy {
    pub swapchain_id: u64,
}

impl Wire for SwapchainDestroy {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.swapchain_id);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, ProtocolError> {
        Ok(Self {
            swapchain_id: wire::get_u64(buf)?,
        })
    }
}

/// Starts a vibration on one haptic output. The service fires a
/// HAPTIC_STOP event once the duration elapses.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct ApplyHaptic {
    pub device_index: u32,
    pub output_index: u32,
    pub duration_ns: i64,
    pub frequency_hz: f32,
    pub amplitude: f32,
}

impl Wire for ApplyHaptic {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.device_index);
        buf.put_u32_le(self.output_index);
        buf.put_i64_le(self.duration_ns);
        buf.put_f32_le(self.frequency_hz);
        buf.put_f32_le(self.amplitude);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, ProtocolError> {
        Ok(Self {
            device_index: wire::get_u32(buf)?,
            output_index: wire::get_u32(buf)?,
            duration_ns: wire::get_i64(buf)?,
            frequency_hz: wire::get_f32(buf)?,
            amplitude: wire::get_f32(buf)?,
        })
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FrameWaited {
    pub frame_id: i64,
    pub predicted_display_ns: i64,
    pub predicted_display_period_ns: i64,
}

impl Wire for FrameWaited {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i64_le(self.frame_id);
        buf.put_i64_le(self.predicted_display_ns);
        buf.put_i64_le(self.predicted_display_period_ns);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, ProtocolError> {
        Ok(Self {
            frame_id: wire::get_i64(buf)?,
            predicted_display_ns: wire::get_i64(buf)?,
            predicted_display_period_ns: wire::get_i64(buf)?,
        })
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BeginFrame {
    pub frame_id: i64,
}

impl Wire for BeginFrame {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i64_le(self.frame_id);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, ProtocolError> {
        Ok(Self {
            frame_id: wire::get_i64(buf)?,
        })
    }
}

/// The frame's layer stack. `display_time_ns` is the prediction the stack
/// was rendered for; the compositor shows it at the first tick at or after
/// that time.
#[derive(Debug, Clone, PartialEq)]
pub struct EndFrame {
    pub frame_id: i64,
    pub display_time_ns: i64,
    pub env_blend_mode: EnvBlendMode,
    pub layers: Vec<LayerEntry>,
}

impl Wire for EndFrame {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_i64_le(self.frame_id);
        buf.put_i64_le(self.display_time_ns);
        self.env_blend_mode.encode(buf);
        wire::put_vec(buf, &self.layers);
    }

    fn decode(buf: &mut Bytes) -> Result<Self, ProtocolError> {
        Ok(Self {
            frame_id: wire::get_i64(buf)?,
            display_time_ns: wire::get_i64(buf)?,
            env_blend_mode: EnvBlendMode::decode(buf)?,
            layers: wire::get_vec(buf, MAX_LAYERS, "layers")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct EventPolled {
    pub event: Option<QueuedEvent>,
}

impl Wire for EventPolled {
    fn encode(&self, buf: &mut BytesMut) {
        match &self.event {
            Some(ev) => {
                buf.put_u32_le(1);
                ev.encode(buf);
            }
            None => buf.put_u32_le(0),
        }
    }

    fn decode(buf: &mut Bytes) -> Result<Self, ProtocolError> {
        let event = match wire::get_u32(buf)? {
            0 => None,
            1 => Some(QueuedEvent::decode(buf)?),
            v => return Err(ProtocolError::InvalidEnum("EventPolled", v)),
        };

        Ok(Self { event })
    }
}
