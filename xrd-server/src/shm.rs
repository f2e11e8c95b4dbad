// Copyright 2025 The xrd authors
//
// SPDX-License-Identifier: MIT

//! The process-global shared-memory region. The service creates it with a
//! name-then-unlink dance so the fd is the only capability, maps it
//! read-write, and hands the fd to clients (which map it read-only by
//! convention). All multi-byte fields are little-endian at 32/64-bit
//! aligned offsets; writers hold the global state lock.

use std::{
    os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd},
    sync::atomic::{AtomicU64, Ordering},
};

use anyhow::{bail, Context};
use xrd_protocol::{Fov, Pose, Rect2D};

use crate::device::{
    DeviceClass, DeviceEntry, DeviceTable, DistortionParams, HmdBlock, InputDesc, InputSnapshot,
    InputType, OriginClass, OutputDesc, OutputType, TrackingOrigin, ViewInfo,
};

pub const SHM_MAGIC: [u8; 8] = *b"MONXRT\0\0";
pub const SHM_VERSION: u32 = 1;

pub const HEADER_SIZE: usize = 64;
pub const ORIGIN_ENTRY_SIZE: usize = 64;
pub const DEVICE_ENTRY_SIZE: usize = 400;
pub const INPUT_ENTRY_SIZE: usize = 112;
pub const OUTPUT_ENTRY_SIZE: usize = 80;
pub const SLOT_ENTRY_SIZE: usize = 24;

const ORIGIN_NAME_LEN: usize = 32;
const DEVICE_NAME_LEN: usize = 256;
const IO_NAME_LEN: usize = 64;

// Offset of the snapshot within an input entry: name[64] + u32 type.
const SNAPSHOT_OFFSET: usize = IO_NAME_LEN + 4;

/// Section offsets, all computed once at creation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Layout {
    pub num_origins: u32,
    pub num_devices: u32,
    pub num_inputs: u32,
    pub num_outputs: u32,
    pub num_slots: u32,
    pub offset_origins: u32,
    pub offset_devices: u32,
    pub offset_inputs: u32,
    pub offset_outputs: u32,
    pub offset_slots: u32,
    pub size: u32,
}

impl Layout {
    pub fn compute(table: &DeviceTable, num_slots: u32) -> Self {
        let offset_origins = HEADER_SIZE as u32;
        let offset_devices = offset_origins + table.origins.len() as u32 * ORIGIN_ENTRY_SIZE as u32;
        let offset_inputs = offset_devices + table.devices.len() as u32 * DEVICE_ENTRY_SIZE as u32;
        let offset_outputs = offset_inputs + table.inputs.len() as u32 * INPUT_ENTRY_SIZE as u32;
        let offset_slots = offset_outputs + table.outputs.len() as u32 * OUTPUT_ENTRY_SIZE as u32;
        let size = offset_slots + num_slots * SLOT_ENTRY_SIZE as u32;

        Self {
            num_origins: table.origins.len() as u32,
            num_devices: table.devices.len() as u32,
            num_inputs: table.inputs.len() as u32,
            num_outputs: table.outputs.len() as u32,
            num_slots,
            offset_origins,
            offset_devices,
            offset_inputs,
            offset_outputs,
            offset_slots,
            size,
        }
    }
}

pub struct ShmRegion {
    fd: OwnedFd,
    ptr: *mut u8,
    len: usize,
    layout: Layout,
}

// The raw pointer is owned by the region and only dereferenced through
// &mut self, which the global state lock serializes.
unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

impl ShmRegion {
    /// Creates the region and writes the device table into it.
    pub fn create(table: &DeviceTable, num_slots: u32, epoch_ns: u64) -> anyhow::Result<Self> {
        use rustix::fs::Mode;
        use rustix::shm::{self, ShmOFlags};

        static NEXT_REGION: AtomicU64 = AtomicU64::new(0);

        let layout = Layout::compute(table, num_slots);
        let name = format!(
            "/xrd-{}-{}",
            std::process::id(),
            NEXT_REGION.fetch_add(1, Ordering::Relaxed)
        );

        let fd = shm::shm_open(
            &*name,
            ShmOFlags::CREATE | ShmOFlags::EXCL | ShmOFlags::RDWR,
            Mode::from_bits_truncate(0o600),
        )
        .context("shm_open")?;

        // Unlink immediately; the fd is the canonical capability.
        shm::shm_unlink(&*name).context("shm_unlink")?;

        rustix::fs::ftruncate(&fd, layout.size as u64).context("ftruncate")?;

        let ptr = unsafe {
            rustix::mm::mmap(
                std::ptr::null_mut(),
                layout.size as usize,
                rustix::mm::ProtFlags::READ | rustix::mm::ProtFlags::WRITE,
                rustix::mm::MapFlags::SHARED,
                &fd,
                0,
            )
            .context("mmap")?
        };

        let mut this = Self {
            fd,
            ptr: ptr as *mut u8,
            len: layout.size as usize,
            layout,
        };

        encode_region(table, &layout, epoch_ns, this.bytes_mut());

        Ok(this)
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    pub fn raw_fd(&self) -> i32 {
        self.fd.as_raw_fd()
    }

    pub fn bytes(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }

    /// Refreshes the input snapshot section.
    pub fn write_snapshots(&mut self, snapshots: &[InputSnapshot]) {
        assert_eq!(snapshots.len(), self.layout.num_inputs as usize);

        let base = self.layout.offset_inputs as usize;
        let buf = self.bytes_mut();
        for (i, snapshot) in snapshots.iter().enumerate() {
            put_snapshot(buf, base + i * INPUT_ENTRY_SIZE + SNAPSHOT_OFFSET, snapshot);
        }
    }

    /// Publishes one output's pending vibration: the stop deadline and
    /// amplitude, or zeros once it has fired.
    pub fn write_output_haptic(&mut self, index: u32, stop_deadline_ns: u64, amplitude: f32) {
        assert!(index < self.layout.num_outputs);

        let off = self.layout.offset_outputs as usize + index as usize * OUTPUT_ENTRY_SIZE;
        let buf = self.bytes_mut();
        put_u64(buf, off + IO_NAME_LEN + 4, stop_deadline_ns);
        put_f32(buf, off + IO_NAME_LEN + 12, amplitude);
    }

    /// Publishes one client render slot's metadata.
    pub fn write_slot(
        &mut self,
        index: u32,
        active: bool,
        layer_count: u32,
        display_time_ns: i64,
        blend_mode: u32,
    ) {
        assert!(index < self.layout.num_slots);

        let off = self.layout.offset_slots as usize + index as usize * SLOT_ENTRY_SIZE;
        let buf = self.bytes_mut();
        put_u32(buf, off, active as u32);
        put_u32(buf, off + 4, layer_count);
        put_i64(buf, off + 8, display_time_ns);
        put_u32(buf, off + 16, blend_mode);
        put_u32(buf, off + 20, 0);
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        unsafe {
            let _ = rustix::mm::munmap(self.ptr as *mut _, self.len);
        }
    }
}

/// Serializes the header and device table. The snapshot fields start out
/// zeroed; `write_snapshots` refreshes them.
pub fn encode_region(table: &DeviceTable, layout: &Layout, epoch_ns: u64, buf: &mut [u8]) {
    assert!(buf.len() >= layout.size as usize);

    buf[0..8].copy_from_slice(&SHM_MAGIC);
    put_u32(buf, 8, SHM_VERSION);
    put_u32(buf, 12, layout.size);
    put_u64(buf, 16, epoch_ns);
    put_u32(buf, 24, layout.num_origins);
    put_u32(buf, 28, layout.num_devices);
    put_u32(buf, 32, layout.num_inputs);
    put_u32(buf, 36, layout.num_outputs);
    put_u32(buf, 40, layout.offset_origins);
    put_u32(buf, 44, layout.offset_devices);
    put_u32(buf, 48, layout.offset_inputs);
    put_u32(buf, 52, layout.offset_outputs);
    put_u32(buf, 56, layout.offset_slots);
    put_u32(buf, 60, 0);

    for (i, origin) in table.origins.iter().enumerate() {
        let off = layout.offset_origins as usize + i * ORIGIN_ENTRY_SIZE;
        put_fixed_str(buf, off, ORIGIN_NAME_LEN, &origin.name);
        put_u32(buf, off + 32, origin.class as u32);
        put_pose(buf, off + 36, &origin.offset);
    }

    for (i, dev) in table.devices.iter().enumerate() {
        let off = layout.offset_devices as usize + i * DEVICE_ENTRY_SIZE;
        put_u32(buf, off, dev.class as u32);
        put_fixed_str(buf, off + 4, DEVICE_NAME_LEN, &dev.name);
        put_u32(buf, off + 260, dev.tracking_origin);
        put_u32(buf, off + 264, dev.num_inputs);
        put_u32(buf, off + 268, dev.first_input);
        put_u32(buf, off + 272, dev.num_outputs);
        put_u32(buf, off + 276, dev.first_output);
        put_u32(buf, off + 280, dev.hmd.is_some() as u32);

        if let Some(hmd) = &dev.hmd {
            put_hmd(buf, off + 284, hmd);
        }
    }

    for (i, input) in table.inputs.iter().enumerate() {
        let off = layout.offset_inputs as usize + i * INPUT_ENTRY_SIZE;
        put_fixed_str(buf, off, IO_NAME_LEN, &input.name);
        put_u32(buf, off + 64, input.ty as u32);
        put_snapshot(buf, off + SNAPSHOT_OFFSET, &InputSnapshot::default());
    }

    for (i, output) in table.outputs.iter().enumerate() {
        let off = layout.offset_outputs as usize + i * OUTPUT_ENTRY_SIZE;
        put_fixed_str(buf, off, IO_NAME_LEN, &output.name);
        put_u32(buf, off + 64, output.ty as u32);
        put_u64(buf, off + 68, 0); // pending haptic stop time
        put_u32(buf, off + 76, 0); // pending haptic amplitude
    }
}

/// Reads the device table back out of an encoded region.
pub fn parse_device_table(buf: &[u8]) -> anyhow::Result<(DeviceTable, u64)> {
    if buf.len() < HEADER_SIZE {
        bail!("region too small for header");
    }

    if buf[0..8] != SHM_MAGIC {
        bail!("bad magic");
    }

    if get_u32(buf, 8) != SHM_VERSION {
        bail!("unsupported version {}", get_u32(buf, 8));
    }

    let size = get_u32(buf, 12) as usize;
    if size > buf.len() {
        bail!("header size {} exceeds region", size);
    }

    let epoch_ns = get_u64(buf, 16);
    let num_origins = get_u32(buf, 24) as usize;
    let num_devices = get_u32(buf, 28) as usize;
    let num_inputs = get_u32(buf, 32) as usize;
    let num_outputs = get_u32(buf, 36) as usize;
    let offset_origins = get_u32(buf, 40) as usize;
    let offset_devices = get_u32(buf, 44) as usize;
    let offset_inputs = get_u32(buf, 48) as usize;
    let offset_outputs = get_u32(buf, 52) as usize;

    let mut table = DeviceTable::default();

    for i in 0..num_origins {
        let off = offset_origins + i * ORIGIN_ENTRY_SIZE;
        check_entry(buf, off, ORIGIN_ENTRY_SIZE)?;

        table.origins.push(TrackingOrigin {
            name: get_fixed_str(buf, off, ORIGIN_NAME_LEN),
            class: OriginClass::from_u32(get_u32(buf, off + 32))
                .ok_or_else(|| anyhow::anyhow!("bad origin class"))?,
            offset: get_pose(buf, off + 36),
        });
    }

    for i in 0..num_devices {
        let off = offset_devices + i * DEVICE_ENTRY_SIZE;
        check_entry(buf, off, DEVICE_ENTRY_SIZE)?;

        let hmd = if get_u32(buf, off + 280) != 0 {
            Some(get_hmd(buf, off + 284))
        } else {
            None
        };

        table.devices.push(DeviceEntry {
            class: DeviceClass::from_u32(get_u32(buf, off))
                .ok_or_else(|| anyhow::anyhow!("bad device class"))?,
            name: get_fixed_str(buf, off + 4, DEVICE_NAME_LEN),
            tracking_origin: get_u32(buf, off + 260),
            num_inputs: get_u32(buf, off + 264),
            first_input: get_u32(buf, off + 268),
            num_outputs: get_u32(buf, off + 272),
            first_output: get_u32(buf, off + 276),
            hmd,
        });
    }

    for i in 0..num_inputs {
        let off = offset_inputs + i * INPUT_ENTRY_SIZE;
        check_entry(buf, off, INPUT_ENTRY_SIZE)?;

        table.inputs.push(InputDesc {
            name: get_fixed_str(buf, off, IO_NAME_LEN),
            ty: InputType::from_u32(get_u32(buf, off + 64))
                .ok_or_else(|| anyhow::anyhow!("bad input type"))?,
        });
    }

    for i in 0..num_outputs {
        let off = offset_outputs + i * OUTPUT_ENTRY_SIZE;
        check_entry(buf, off, OUTPUT_ENTRY_SIZE)?;

        table.outputs.push(OutputDesc {
            name: get_fixed_str(buf, off, IO_NAME_LEN),
            ty: match get_u32(buf, off + 64) {
                0 => OutputType::HapticVibration,
                v => bail!("bad output type {}", v),
            },
        });
    }

    Ok((table, epoch_ns))
}

fn check_entry(buf: &[u8], off: usize, size: usize) -> anyhow::Result<()> {
    if off + size > buf.len() {
        bail!("entry at {:#x} overruns region", off);
    }

    Ok(())
}

fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn put_i64(buf: &mut [u8], off: usize, v: i64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

fn put_f32(buf: &mut [u8], off: usize, v: f32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn get_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}

fn get_i64(buf: &[u8], off: usize) -> i64 {
    i64::from_le_bytes(buf[off..off + 8].try_into().unwrap())
}

fn get_u64(buf: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(buf[off..off + 8].try_into().unwrap())
}

fn get_f32(buf: &[u8], off: usize) -> f32 {
    f32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
}

/// NUL-padded, truncated to fit with a terminating NUL.
fn put_fixed_str(buf: &mut [u8], off: usize, len: usize, s: &str) {
    let field = &mut buf[off..off + len];
    field.fill(0);

    let n = s.len().min(len - 1);
    field[..n].copy_from_slice(&s.as_bytes()[..n]);
}

fn get_fixed_str(buf: &[u8], off: usize, len: usize) -> String {
    let field = &buf[off..off + len];
    let end = field.iter().position(|&b| b == 0).unwrap_or(len);
    String::from_utf8_lossy(&field[..end]).into_owned()
}

fn put_pose(buf: &mut [u8], off: usize, pose: &Pose) {
    for (i, v) in pose.orientation.iter().enumerate() {
        put_f32(buf, off + i * 4, *v);
    }
    for (i, v) in pose.position.iter().enumerate() {
        put_f32(buf, off + 16 + i * 4, *v);
    }
}

fn get_pose(buf: &[u8], off: usize) -> Pose {
    let mut pose = Pose::IDENTITY;
    for (i, v) in pose.orientation.iter_mut().enumerate() {
        *v = get_f32(buf, off + i * 4);
    }
    for (i, v) in pose.position.iter_mut().enumerate() {
        *v = get_f32(buf, off + 16 + i * 4);
    }

    pose
}

fn put_rect(buf: &mut [u8], off: usize, rect: &Rect2D) {
    put_u32(buf, off, rect.x as u32);
    put_u32(buf, off + 4, rect.y as u32);
    put_u32(buf, off + 8, rect.width);
    put_u32(buf, off + 12, rect.height);
}

fn get_rect(buf: &[u8], off: usize) -> Rect2D {
    Rect2D {
        x: get_u32(buf, off) as i32,
        y: get_u32(buf, off + 4) as i32,
        width: get_u32(buf, off + 8),
        height: get_u32(buf, off + 12),
    }
}

fn put_fov(buf: &mut [u8], off: usize, fov: &Fov) {
    put_f32(buf, off, fov.angle_left);
    put_f32(buf, off + 4, fov.angle_right);
    put_f32(buf, off + 8, fov.angle_up);
    put_f32(buf, off + 12, fov.angle_down);
}

fn get_fov(buf: &[u8], off: usize) -> Fov {
    Fov {
        angle_left: get_f32(buf, off),
        angle_right: get_f32(buf, off + 4),
        angle_up: get_f32(buf, off + 8),
        angle_down: get_f32(buf, off + 12),
    }
}

fn put_hmd(buf: &mut [u8], off: usize, hmd: &HmdBlock) {
    put_rect(buf, off, &hmd.views[0].viewport);
    put_rect(buf, off + 16, &hmd.views[1].viewport);
    put_fov(buf, off + 32, &hmd.views[0].fov);
    put_fov(buf, off + 48, &hmd.views[1].fov);
    put_u32(buf, off + 64, hmd.display_resolution[0]);
    put_u32(buf, off + 68, hmd.display_resolution[1]);
    put_f32(buf, off + 72, hmd.refresh_hz);
    for (eye, k) in hmd.distortion.k.iter().enumerate() {
        for (i, v) in k.iter().enumerate() {
            put_f32(buf, off + 76 + eye * 16 + i * 4, *v);
        }
    }
}

fn get_hmd(buf: &[u8], off: usize) -> HmdBlock {
    let mut distortion = DistortionParams::default();
    for (eye, k) in distortion.k.iter_mut().enumerate() {
        for (i, v) in k.iter_mut().enumerate() {
            *v = get_f32(buf, off + 76 + eye * 16 + i * 4);
        }
    }

    HmdBlock {
        views: [
            ViewInfo {
                viewport: get_rect(buf, off),
                fov: get_fov(buf, off + 32),
            },
            ViewInfo {
                viewport: get_rect(buf, off + 16),
                fov: get_fov(buf, off + 48),
            },
        ],
        display_resolution: [get_u32(buf, off + 64), get_u32(buf, off + 68)],
        refresh_hz: get_f32(buf, off + 72),
        distortion,
    }
}

fn put_snapshot(buf: &mut [u8], off: usize, snapshot: &InputSnapshot) {
    put_i64(buf, off, snapshot.timestamp_ns);
    put_pose(buf, off + 8, &snapshot.pose);
    put_f32(buf, off + 36, snapshot.value);
    put_u32(buf, off + 40, snapshot.pressed as u32);
}

#[allow(dead_code)]
fn get_snapshot(buf: &[u8], off: usize) -> InputSnapshot {
    InputSnapshot {
        timestamp_ns: get_i64(buf, off),
        pose: get_pose(buf, off + 8),
        value: get_f32(buf, off + 36),
        pressed: get_u32(buf, off + 40) != 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use pretty_assertions::assert_eq;

    #[test]
    fn device_table_roundtrip() {
        let table = DeviceTable::simulated(&Config::default());
        let layout = Layout::compute(&table, 4);

        let mut buf = vec![0u8; layout.size as usize];
        encode_region(&table, &layout, 777, &mut buf);

        let (parsed, epoch_ns) = parse_device_table(&buf).unwrap();
        assert_eq!(epoch_ns, 777);
        assert_eq!(parsed, table);
    }

    // A fresh service with the same device list produces an identical
    // region, so a restarted service is indistinguishable to readers.
    #[test]
    fn stable_across_restart() {
        let cfg = Config::default();

        let encode = || {
            let table = DeviceTable::simulated(&cfg);
            let layout = Layout::compute(&table, 8);
            let mut buf = vec![0u8; layout.size as usize];
            encode_region(&table, &layout, 42, &mut buf);
            buf
        };

        assert_eq!(encode(), encode());
    }

    #[test]
    fn create_and_map() {
        let table = DeviceTable::simulated(&Config::default());
        let mut region = ShmRegion::create(&table, 2, 1).unwrap();

        let (parsed, _) = parse_device_table(region.bytes()).unwrap();
        assert_eq!(parsed, table);

        let snapshots = vec![
            InputSnapshot {
                timestamp_ns: 99,
                ..Default::default()
            };
            table.inputs.len()
        ];
        region.write_snapshots(&snapshots);

        let off = region.layout().offset_inputs as usize + SNAPSHOT_OFFSET;
        assert_eq!(get_snapshot(region.bytes(), off).timestamp_ns, 99);

        region.write_slot(1, true, 2, 123, 0);
        let slot_off = region.layout().offset_slots as usize + SLOT_ENTRY_SIZE;
        assert_eq!(get_u32(region.bytes(), slot_off), 1);
        assert_eq!(get_i64(region.bytes(), slot_off + 8), 123);

        region.write_output_haptic(0, 555, 0.5);
        let out_off = region.layout().offset_outputs as usize;
        assert_eq!(get_u64(region.bytes(), out_off + 68), 555);
        assert_eq!(get_f32(region.bytes(), out_off + 76), 0.5);
    }
}
