// Copyright 2025 The xrd authors
//
// SPDX-License-Identifier: MIT

//! The device table: every tracked peripheral the service exposes, plus
//! the simulated provider used when no hardware driver is loaded.
//!
//! The table is populated once at startup and read-only afterwards;
//! only the input snapshots change, under the global state lock.

use std::fmt;

use xrd_protocol::{Fov, Pose, Rect2D};

use crate::config::Config;

/// Fixed capacity of the device table.
pub const MAX_DEVICES: usize = 32;

#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DeviceClass {
    Hmd = 0,
    LeftController = 1,
    RightController = 2,
    Gamepad = 3,
    Tracker = 4,
    Eyes = 5,
}

impl DeviceClass {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Hmd),
            1 => Some(Self::LeftController),
            2 => Some(Self::RightController),
            3 => Some(Self::Gamepad),
            4 => Some(Self::Tracker),
            5 => Some(Self::Eyes),
            _ => None,
        }
    }
}

#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OriginClass {
    Static = 0,
    DeviceRelative = 1,
    World = 2,
}

impl OriginClass {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Static),
            1 => Some(Self::DeviceRelative),
            2 => Some(Self::World),
            _ => None,
        }
    }
}

/// A coordinate frame that device poses are expressed in.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackingOrigin {
    pub name: String,
    pub class: OriginClass,
    pub offset: Pose,
}

#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InputType {
    Pose = 0,
    Button = 1,
    Trigger = 2,
    Thumbstick = 3,
}

impl InputType {
    pub fn from_u32(v: u32) -> Option<Self> {
        match v {
            0 => Some(Self::Pose),
            1 => Some(Self::Button),
            2 => Some(Self::Trigger),
            3 => Some(Self::Thumbstick),
            _ => None,
        }
    }
}

#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OutputType {
    HapticVibration = 0,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InputDesc {
    pub name: String,
    pub ty: InputType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputDesc {
    pub name: String,
    pub ty: OutputType,
}

/// The live value of one input, refreshed every render tick.
#[derive(Debug, Copy, Clone, PartialEq, Default)]
pub struct InputSnapshot {
    pub timestamp_ns: i64,
    pub pose: Pose,
    pub value: f32,
    pub pressed: bool,
}

#[derive(Debug, Copy, Clone, PartialEq, Default)]
pub struct ViewInfo {
    pub viewport: Rect2D,
    pub fov: Fov,
}

/// Radial distortion polynomial coefficients, per eye.
#[derive(Debug, Copy, Clone, PartialEq, Default)]
pub struct DistortionParams {
    pub k: [[f32; 4]; 2],
}

#[derive(Debug, Clone, PartialEq)]
pub struct HmdBlock {
    pub views: [ViewInfo; 2],
    pub display_resolution: [u32; 2],
    pub refresh_hz: f32,
    pub distortion: DistortionParams,
}

/// One entry of the device table. Inputs and outputs are ranges into the
/// table-global descriptor arrays, mirroring the shared-memory layout.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceEntry {
    pub name: String,
    pub class: DeviceClass,
    pub tracking_origin: u32,
    pub first_input: u32,
    pub num_inputs: u32,
    pub first_output: u32,
    pub num_outputs: u32,
    pub hmd: Option<HmdBlock>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct DeviceTable {
    pub origins: Vec<TrackingOrigin>,
    pub devices: Vec<DeviceEntry>,
    pub inputs: Vec<InputDesc>,
    pub outputs: Vec<OutputDesc>,
}

impl DeviceTable {
    pub fn hmd(&self) -> Option<&DeviceEntry> {
        self.devices.iter().find(|d| d.class == DeviceClass::Hmd)
    }

    /// Builds the simulated device set: one HMD and two controllers.
    pub fn simulated(cfg: &Config) -> Self {
        let mut builder = TableBuilder::default();

        let world = builder.origin(TrackingOrigin {
            name: "world".into(),
            class: OriginClass::World,
            offset: Pose::IDENTITY,
        });

        let floor = builder.origin(TrackingOrigin {
            name: "local-floor".into(),
            class: OriginClass::Static,
            offset: Pose {
                orientation: [0.0, 0.0, 0.0, 1.0],
                position: [0.0, 1.6, 0.0],
            },
        });

        let fov = simulated_fov(cfg);
        let viewport = Rect2D {
            x: 0,
            y: 0,
            width: cfg.display.view_width,
            height: cfg.display.view_height,
        };

        builder.device(
            DeviceEntry {
                name: "Simulated HMD".into(),
                class: DeviceClass::Hmd,
                tracking_origin: floor,
                first_input: 0,
                num_inputs: 0,
                first_output: 0,
                num_outputs: 0,
                hmd: Some(HmdBlock {
                    views: [
                        ViewInfo {
                            viewport,
                            fov: fov[0],
                        },
                        ViewInfo {
                            viewport: Rect2D {
                                x: cfg.display.view_width as i32,
                                ..viewport
                            },
                            fov: fov[1],
                        },
                    ],
                    display_resolution: [cfg.display.view_width * 2, cfg.display.view_height],
                    refresh_hz: cfg.display.refresh_hz as f32,
                    distortion: DistortionParams {
                        k: [[1.0, -0.02, 0.015, 0.0]; 2],
                    },
                }),
            },
            vec![InputDesc {
                name: "head-pose".into(),
                ty: InputType::Pose,
            }],
            vec![],
        );

        for (name, class) in [
            ("Simulated Controller (Left)", DeviceClass::LeftController),
            ("Simulated Controller (Right)", DeviceClass::RightController),
        ] {
            builder.device(
                DeviceEntry {
                    name: name.into(),
                    class,
                    tracking_origin: world,
                    first_input: 0,
                    num_inputs: 0,
                    first_output: 0,
                    num_outputs: 0,
                    hmd: None,
                },
                vec![
                    InputDesc {
                        name: "grip-pose".into(),
                        ty: InputType::Pose,
                    },
                    InputDesc {
                        name: "aim-pose".into(),
                        ty: InputType::Pose,
                    },
                    InputDesc {
                        name: "trigger".into(),
                        ty: InputType::Trigger,
                    },
                    InputDesc {
                        name: "primary".into(),
                        ty: InputType::Button,
                    },
                ],
                vec![OutputDesc {
                    name: "haptic".into(),
                    ty: OutputType::HapticVibration,
                }],
            );
        }

        builder.finish()
    }
}

impl fmt::Display for DeviceTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "tracking origins:")?;
        for (i, origin) in self.origins.iter().enumerate() {
            writeln!(
                f,
                "  [{}] {} ({:?}) at {:?}",
                i, origin.name, origin.class, origin.offset.position
            )?;
        }

        writeln!(f, "devices:")?;
        for dev in &self.devices {
            writeln!(
                f,
                "  {} ({:?}, origin {})",
                dev.name, dev.class, dev.tracking_origin
            )?;

            for input in dev.input_range().map(|i| &self.inputs[i]) {
                writeln!(f, "    in:  {} ({:?})", input.name, input.ty)?;
            }

            for output in dev.output_range().map(|i| &self.outputs[i]) {
                writeln!(f, "    out: {} ({:?})", output.name, output.ty)?;
            }

            if let Some(hmd) = &dev.hmd {
                writeln!(
                    f,
                    "    display {}x{} @ {} Hz",
                    hmd.display_resolution[0], hmd.display_resolution[1], hmd.refresh_hz
                )?;
            }
        }

        Ok(())
    }
}

impl DeviceEntry {
    pub fn input_range(&self) -> std::ops::Range<usize> {
        self.first_input as usize..(self.first_input + self.num_inputs) as usize
    }

    pub fn output_range(&self) -> std::ops::Range<usize> {
        self.first_output as usize..(self.first_output + self.num_outputs) as usize
    }
}

#[derive(Default)]
struct TableBuilder {
    table: DeviceTable,
}

impl TableBuilder {
    fn origin(&mut self, origin: TrackingOrigin) -> u32 {
        self.table.origins.push(origin);
        (self.table.origins.len() - 1) as u32
    }

    fn device(&mut self, mut entry: DeviceEntry, inputs: Vec<InputDesc>, outputs: Vec<OutputDesc>) {
        assert!(self.table.devices.len() < MAX_DEVICES);

        entry.first_input = self.table.inputs.len() as u32;
        entry.num_inputs = inputs.len() as u32;
        entry.first_output = self.table.outputs.len() as u32;
        entry.num_outputs = outputs.len() as u32;

        self.table.inputs.extend(inputs);
        self.table.outputs.extend(outputs);
        self.table.devices.push(entry);
    }

    fn finish(self) -> DeviceTable {
        self.table
    }
}

fn simulated_fov(cfg: &Config) -> [Fov; 2] {
    if let Some([l, r, u, d]) = cfg.debug.fov_override {
        let fov = Fov {
            angle_left: l,
            angle_right: r,
            angle_up: u,
            angle_down: d,
        };

        return [fov, fov];
    }

    let sym = Fov {
        angle_left: -0.942478,
        angle_right: 0.698132,
        angle_up: 0.733038,
        angle_down: -0.942478,
    };

    [
        sym,
        Fov {
            angle_left: -sym.angle_right,
            angle_right: -sym.angle_left,
            ..sym
        },
    ]
}

/// Source of live poses and input values. Drivers for real hardware are
/// external; the built-in provider animates a plausible standing user.
pub trait DeviceProvider: Send {
    fn refresh(&mut self, now_ns: i64, table: &DeviceTable, snapshots: &mut [InputSnapshot]);
}

#[derive(Default)]
pub struct SimulatedProvider {}

impl DeviceProvider for SimulatedProvider {
    fn refresh(&mut self, now_ns: i64, table: &DeviceTable, snapshots: &mut [InputSnapshot]) {
        let t = now_ns as f32 / 1e9;

        for dev in &table.devices {
            let base = match dev.class {
                DeviceClass::Hmd => [0.0, 1.6, 0.0],
                DeviceClass::LeftController => [-0.2, 1.2, -0.3],
                DeviceClass::RightController => [0.2, 1.2, -0.3],
                _ => [0.0, 0.0, 0.0],
            };

            // Gentle sway, so clients see poses move.
            let sway = (t * 0.5).sin() * 0.01;

            for i in dev.input_range() {
                let snapshot = &mut snapshots[i];
                snapshot.timestamp_ns = now_ns;

                match table.inputs[i].ty {
                    InputType::Pose => {
                        snapshot.pose = Pose {
                            orientation: [0.0, 0.0, 0.0, 1.0],
                            position: [base[0] + sway, base[1], base[2]],
                        };
                    }
                    InputType::Trigger | InputType::Thumbstick => snapshot.value = 0.0,
                    InputType::Button => snapshot.pressed = false,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simulated_table_shape() {
        let table = DeviceTable::simulated(&Config::default());

        assert_eq!(table.devices.len(), 3);
        assert!(table.hmd().is_some());
        assert_eq!(table.inputs.len(), 1 + 4 + 4);
        assert_eq!(table.outputs.len(), 2);

        // Ranges must tile the descriptor arrays.
        for dev in &table.devices {
            assert!(dev.input_range().end <= table.inputs.len());
            assert!(dev.output_range().end <= table.outputs.len());
        }
    }

    #[test]
    fn provider_stamps_snapshots() {
        let table = DeviceTable::simulated(&Config::default());
        let mut snapshots = vec![InputSnapshot::default(); table.inputs.len()];

        SimulatedProvider::default().refresh(123, &table, &mut snapshots);

        assert!(snapshots.iter().all(|s| s.timestamp_ns == 123));
    }
}
