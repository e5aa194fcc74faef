// Copyright 2025 The Axvisor Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! LoongArch vCPU - trap-and-emulate core for LoongArch hardware-assisted virtualization.
//!
//! This crate implements the part of a LoongArch hypervisor that sits between a guest exit and
//! the next guest entry: classifying the exit, emulating the handful of privileged instructions
//! that trap (CSR access, IOCSR access, `idle`, `cpucfg`, cache maintenance), turning unbacked
//! guest memory accesses into MMIO transactions for the host, and preparing the next entry
//! (interrupt injection, VPID revalidation, timer and FPU hand-off).
//!
//! Everything that touches real hardware is delegated to an implementation of [`LaVCpuHal`].
//!
//! # Features
//!
//! - Exit dispatch for general software traps, paging faults, FPU-disabled and interrupt exits
//! - Guest CSR mirror with the ESTAT/GINTC split storage
//! - MMIO and IOCSR transactions completed across the host run-loop boundary
//! - Pending/clear interrupt bitsets safe to drive from other vCPU threads
//! - Per-physical-CPU VPID generations with rollover handling
//! - State machine for vCPU lifecycle (Created → Free → Ready → Running)

#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate alloc;
#[macro_use]
extern crate log;

// Core modules
mod addr; // Guest address types
mod consts; // Architectural constants: exception codes, CSR ids, interrupt numbers
mod csr; // Guest CSR mirror with capability tags and ESTAT/GINTC split storage
mod exit; // VM exit reasons reported to the host
mod hal; // Hardware abstraction layer interfaces
mod insn; // Instruction word field views
mod irq; // Interrupt pending/clear bitsets and delivery
mod mmio; // MMIO and IOCSR transaction decoding and completion
mod percpu; // Per-physical-CPU VPID contexts
mod regs; // One-register ids and bulk register transfer types
mod test; // Run-loop tests against a mock hardware layer
mod timer; // Guest timer hand-off bookkeeping
mod trap; // Exit dispatcher and instruction emulation
mod vcpu; // Main vCPU implementation, run loop and state management
mod vm; // Per-VM shared state: vCPU registry, cpucfg table, time offset

// Public API exports
pub use addr::GuestPhysAddr;
pub use consts::{csr as csr_id, irq as irq_num};
pub use csr::{CsrCapability, CsrFile};
pub use exit::{AccessWidth, InternalErrorKind, IoRequest, LaVCpuExitReason};
pub use hal::{GuestContext, GuestExit, LaVCpuHal, NeedsMmio};
pub use insn::LaInst;
pub use irq::VCpuSignals;
pub use mmio::{Extension, IoSpace, PendingIo};
pub use percpu::{VpidContext, VpidContexts};
pub use regs::{FpuContext, LaRegs, OneRegId};
pub use timer::TimerMode;
pub use trap::{EmulateResult, ExitDecision};
pub use vcpu::*;
pub use vm::{CpucfgTable, LaVm, LaVmConfig};
