#[cfg(test)]
mod tests {
    use crate::consts::{csr, estat, exccode, irq};
    use crate::{
        AccessWidth, FpuContext, GuestContext, GuestExit, GuestPhysAddr, InternalErrorKind,
        IoRequest, LaRegs, LaVCpu, LaVCpuCreateConfig, LaVCpuExitReason, LaVCpuHal, LaVm,
        LaVmConfig, MpState, NeedsMmio, OneRegId, TimerMode, VCpuSignals, VCpuState,
    };
    use alloc::{
        collections::VecDeque,
        string::{String, ToString},
        sync::Arc,
        vec::Vec,
    };
    use axerrno::AxError;
    use core::cell::RefCell;
    use std::sync::{mpsc, Condvar, Mutex};
    use std::thread;
    use std::time::Duration;

    const ENTRY: u64 = 0x9000_0000;
    const MMIO_BASE: u64 = 0x1000_0000;
    const MMIO_SIZE: u64 = 0x1000;

    // Instruction words used by the guest scripts.
    const IDLE: u32 = 0x0648_8000;
    const CACOP: u32 = 0x0600_0000;

    fn cpucfg(rd: u32, rj: u32) -> u32 {
        0x0000_6c00 | (rj << 5) | rd
    }

    fn csr_op(rd: u32, rj: u32, csr: u16) -> u32 {
        0x0400_0000 | ((csr as u32) << 10) | (rj << 5) | rd
    }

    fn ld_w(rd: u32, rj: u32) -> u32 {
        0x2880_0000 | (rj << 5) | rd
    }

    fn ld_bu(rd: u32, rj: u32) -> u32 {
        0x2a00_0000 | (rj << 5) | rd
    }

    fn st_w(rd: u32, rj: u32) -> u32 {
        0x2980_0000 | (rj << 5) | rd
    }

    fn iocsrrd_w(rd: u32, rj: u32) -> u32 {
        0x0648_0800 | (rj << 5) | rd
    }

    fn iocsrwr_d(rd: u32, rj: u32) -> u32 {
        0x0648_1c00 | (rj << 5) | rd
    }

    fn exit_with(ecode: u32, badv: u64, badi: u32) -> GuestExit {
        GuestExit {
            estat: (ecode as u64) << estat::ECODE_SHIFT,
            badv,
            badi,
        }
    }

    fn gspr(badi: u32) -> GuestExit {
        exit_with(exccode::GSPR, 0, badi)
    }

    /// What the mock hardware saw at one guest entry.
    #[derive(Debug, Clone)]
    struct Entry {
        pc: u64,
        vpid: u64,
        gintc: u64,
        estat: u64,
        dirty: usize,
    }

    #[derive(Default)]
    struct MockState {
        exits: VecDeque<GuestExit>,
        entries: Vec<Entry>,
        call_log: Vec<String>,
        cpu: usize,
        counter: u64,
        irq_disabled: bool,
        signal: bool,
        flushes: usize,
        blocked_tx: Option<mpsc::Sender<()>>,
        /// Fires the software timer this long after the guest timer moves to software.
        arm_timer: Option<Duration>,
    }

    std::thread_local! {
        static STATE: RefCell<MockState> = RefCell::new(MockState::default());
    }

    /// Kicked `(vm_id, vcpu_id)` pairs not yet consumed by a parked vCPU.
    static KICKS: Mutex<Vec<(usize, usize)>> = Mutex::new(Vec::new());
    static KICKED: Condvar = Condvar::new();

    fn with_state<R>(f: impl FnOnce(&mut MockState) -> R) -> R {
        STATE.with(|state| f(&mut state.borrow_mut()))
    }

    fn log(entry: String) {
        with_state(|s| s.call_log.push(entry));
    }

    fn call_log() -> Vec<String> {
        with_state(|s| s.call_log.clone())
    }

    fn entries() -> Vec<Entry> {
        with_state(|s| s.entries.clone())
    }

    /// Queues guest exits for the next `run`. Once they run out the mock raises a host signal.
    fn script(exits: impl IntoIterator<Item = GuestExit>) {
        with_state(|s| {
            s.exits.extend(exits);
            s.signal = false;
        });
    }

    struct MockHal;

    impl LaVCpuHal for MockHal {
        fn current_cpu() -> usize {
            with_state(|s| s.cpu)
        }

        fn read_host_cpucfg(index: usize) -> u32 {
            if index == 0 {
                0x0014_c010
            } else {
                u32::MAX
            }
        }

        fn read_counter() -> u64 {
            with_state(|s| s.counter)
        }

        fn local_irq_disable() {
            with_state(|s| s.irq_disabled = true);
        }

        fn local_irq_enable() {
            with_state(|s| s.irq_disabled = false);
        }

        fn enter_guest(ctx: GuestContext<'_>) -> GuestExit {
            let dirty = ctx.csr.take_dirty().count();
            with_state(|s| {
                assert!(s.irq_disabled, "guest entered with interrupts enabled");
                s.entries.push(Entry {
                    pc: *ctx.pc,
                    vpid: ctx.vpid,
                    gintc: ctx.csr.gintc(),
                    estat: ctx.csr.raw_estat(),
                    dirty,
                });
                s.exits.pop_front().unwrap_or_else(|| {
                    s.signal = true;
                    // A host timer interrupt, nothing for the guest.
                    GuestExit {
                        estat: 1 << 11,
                        ..Default::default()
                    }
                })
            })
        }

        fn flush_guest_tlb_all() {
            with_state(|s| s.flushes += 1);
            log("flush_guest_tlb_all".to_string());
        }

        fn resolve_guest_page_fault(
            _vm_id: usize,
            _vcpu_id: usize,
            gpa: GuestPhysAddr,
            is_write: bool,
        ) -> Result<(), NeedsMmio> {
            let addr = gpa.as_usize() as u64;
            log(format!("page_fault({:#x}, {})", addr, is_write));
            if (MMIO_BASE..MMIO_BASE + MMIO_SIZE).contains(&addr) {
                Err(NeedsMmio)
            } else {
                Ok(())
            }
        }

        fn save_fpu(fpu: &mut FpuContext) {
            let cpu = with_state(|s| s.cpu);
            fpu.fcsr = 0x50 + cpu as u32;
            log(format!("save_fpu@{}", cpu));
        }

        fn restore_fpu(fpu: &FpuContext) {
            let cpu = with_state(|s| s.cpu);
            log(format!("restore_fpu({:#x})@{}", fpu.fcsr, cpu));
        }

        fn timer_to_software(_vcpu_id: usize, _csr: &crate::CsrFile, signals: &Arc<VCpuSignals>) {
            log("timer_to_software".to_string());
            if let Some(delay) = with_state(|s| s.arm_timer) {
                let signals = signals.clone();
                thread::spawn(move || {
                    thread::sleep(delay);
                    signals.queue(irq::TI).unwrap();
                });
            }
        }

        fn timer_to_hardware(_vcpu_id: usize, _csr: &mut crate::CsrFile) {
            log("timer_to_hardware".to_string());
        }

        fn signal_pending() -> bool {
            with_state(|s| s.signal)
        }

        /// Parks until `kick_vcpu` names this vCPU.
        fn wait_for_wakeup(vm_id: usize, vcpu_id: usize, _signals: &VCpuSignals) {
            let notify = with_state(|s| {
                if s.call_log.last().map(String::as_str) != Some("wait_for_wakeup") {
                    s.call_log.push("wait_for_wakeup".to_string());
                }
                s.blocked_tx.take()
            });
            if let Some(tx) = notify {
                let _ = tx.send(());
            }

            let key = (vm_id, vcpu_id);
            let kicks = KICKS.lock().unwrap();
            let (mut kicks, result) = KICKED
                .wait_timeout_while(kicks, Duration::from_secs(5), |k| !k.contains(&key))
                .unwrap();
            if result.timed_out() {
                log("wakeup_timeout".to_string());
            } else {
                kicks.retain(|k| *k != key);
            }
        }

        fn kick_vcpu(vm_id: usize, vcpu_id: usize) {
            let mut kicks = KICKS.lock().unwrap();
            if !kicks.contains(&(vm_id, vcpu_id)) {
                kicks.push((vm_id, vcpu_id));
            }
            KICKED.notify_all();
        }
    }

    fn create_vm(nr_cpus: usize) -> Arc<LaVm<MockHal>> {
        create_vm_with_id(1, nr_cpus)
    }

    /// VMs whose vCPUs park need an id no other test kicks.
    fn create_vm_with_id(id: usize, nr_cpus: usize) -> Arc<LaVm<MockHal>> {
        let config = LaVmConfig {
            nr_cpus,
            ..Default::default()
        };
        LaVm::new(id, config).unwrap()
    }

    fn ready_vcpu(vm: &Arc<LaVm<MockHal>>, id: usize) -> LaVCpu<MockHal> {
        let mut vcpu = vm.create_vcpu(id, LaVCpuCreateConfig::default()).unwrap();
        vcpu.setup(GuestPhysAddr::from(ENTRY as usize)).unwrap();
        vcpu.bind().unwrap();
        vcpu
    }

    fn position(log: &[String], entry: &str) -> Option<usize> {
        log.iter().position(|e| e == entry)
    }

    #[test]
    fn test_vcpu_creation() {
        let vm = create_vm(1);
        let vcpu = vm.create_vcpu(0, LaVCpuCreateConfig::default()).unwrap();

        assert_eq!(vcpu.id(), 0);
        assert!(vcpu.is_bsp());
        assert_eq!(vcpu.state(), VCpuState::Created);
        assert_eq!(vcpu.csr().read(csr::CRMD), csr::CRMD_DA);
        assert_eq!(vcpu.csr().read(csr::TMID), 0);
        assert_eq!(vcpu.mp_state(), MpState::Runnable);
        assert_eq!(vcpu.timer_mode(), TimerMode::Hardware);
        assert_eq!(vcpu.timer_hz(), 100_000_000);

        let vcpu1 = vm.create_vcpu(1, LaVCpuCreateConfig { timer_hz: 1000 }).unwrap();
        assert!(!vcpu1.is_bsp());
        assert_eq!(vcpu1.csr().read(csr::TMID), 1);
        assert_eq!(vcpu1.timer_hz(), 1000);
    }

    #[test]
    fn test_vcpu_duplicate_id_rejected() {
        let vm = create_vm(1);
        let _vcpu = vm.create_vcpu(2, LaVCpuCreateConfig::default()).unwrap();
        let err = vm.create_vcpu(2, LaVCpuCreateConfig::default()).err();
        assert_eq!(err, Some(AxError::AlreadyExists));
    }

    #[test]
    fn test_vcpu_state_transitions() {
        let vm = create_vm(1);
        let mut vcpu = vm.create_vcpu(0, LaVCpuCreateConfig::default()).unwrap();

        // Created -> Free
        assert_eq!(vcpu.state(), VCpuState::Created);
        let result = vcpu.transition_state(VCpuState::Created, VCpuState::Free);
        assert!(result.is_ok());
        assert_eq!(vcpu.state(), VCpuState::Free);

        // Free -> Ready
        let result = vcpu.transition_state(VCpuState::Free, VCpuState::Ready);
        assert!(result.is_ok());
        assert_eq!(vcpu.state(), VCpuState::Ready);

        // Invalid transition should fail
        let result = vcpu.transition_state(VCpuState::Running, VCpuState::Free);
        assert!(result.is_err());
        assert_eq!(vcpu.state(), VCpuState::Invalid);
    }

    #[test]
    fn test_vcpu_lifecycle() {
        let vm = create_vm(1);
        let mut vcpu = vm.create_vcpu(0, LaVCpuCreateConfig::default()).unwrap();

        vcpu.setup(GuestPhysAddr::from(ENTRY as usize)).unwrap();
        assert_eq!(vcpu.state(), VCpuState::Free);
        assert_eq!(vcpu.pc(), ENTRY);

        vcpu.bind().unwrap();
        assert_eq!(vcpu.state(), VCpuState::Ready);
        assert_eq!(vm.contexts().get(0).unwrap().last_vcpu(), Some(0));

        script([]);
        assert_eq!(vcpu.run().unwrap(), LaVCpuExitReason::Interrupted);
        assert_eq!(vcpu.state(), VCpuState::Ready);

        vcpu.unbind().unwrap();
        assert_eq!(vcpu.state(), VCpuState::Free);
    }

    #[test]
    fn test_vcpu_run_without_bind() {
        let vm = create_vm(1);
        let mut vcpu = vm.create_vcpu(0, LaVCpuCreateConfig::default()).unwrap();
        vcpu.setup(GuestPhysAddr::from(ENTRY as usize)).unwrap();

        assert_eq!(vcpu.run().err(), Some(AxError::BadState));
        assert_eq!(vcpu.state(), VCpuState::Invalid);
        assert!(entries().is_empty());
    }

    #[test]
    fn test_vcpu_bind_on_unknown_cpu_fails() {
        let vm = create_vm(1);
        let mut vcpu = vm.create_vcpu(0, LaVCpuCreateConfig::default()).unwrap();
        vcpu.setup(GuestPhysAddr::from(ENTRY as usize)).unwrap();
        with_state(|s| s.cpu = 4);
        assert!(vcpu.bind().is_err());
        assert_eq!(vcpu.state(), VCpuState::Invalid);
    }

    #[test]
    fn test_vcpu_state_display() {
        assert_eq!(VCpuState::Created as u8, 1);
        assert_eq!(VCpuState::Free as u8, 2);
        assert_eq!(VCpuState::Ready as u8, 3);
        assert_eq!(VCpuState::Running as u8, 4);
        assert_eq!(VCpuState::Blocked as u8, 5);
        assert_eq!(VCpuState::Invalid as u8, 0);
    }

    #[test]
    fn test_idle_blocks_until_timer_interrupt() {
        let (vm_tx, vm_rx) = mpsc::channel();
        let (blocked_tx, blocked_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();

        let worker = thread::spawn(move || {
            with_state(|s| s.blocked_tx = Some(blocked_tx));
            let vm = create_vm_with_id(100, 1);
            vm_tx.send(vm.clone()).unwrap();
            let mut vcpu = ready_vcpu(&vm, 0);
            script([gspr(IDLE)]);
            let exit = vcpu.run();
            done_tx
                .send((exit, vcpu.pc(), vcpu.stats().idle_exits, call_log()))
                .unwrap();
        });

        let vm = vm_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        blocked_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("vCPU never blocked");
        vm.inject_interrupt(0, irq::TI as i32).unwrap();

        let (exit, pc, idle_exits, log) = done_rx
            .recv_timeout(Duration::from_secs(5))
            .expect("vCPU did not wake up");
        worker.join().unwrap();

        assert_eq!(exit.unwrap(), LaVCpuExitReason::Interrupted);
        assert_eq!(pc, ENTRY + 4);
        assert_eq!(idle_exits, 1);
        let to_sw = position(&log, "timer_to_software").unwrap();
        let wait = position(&log, "wait_for_wakeup").unwrap();
        let to_hw = position(&log, "timer_to_hardware").unwrap();
        assert!(to_sw < wait);
        assert!(wait < to_hw);
        assert_eq!(position(&log, "wakeup_timeout"), None);
    }

    #[test]
    fn test_idle_wakes_on_software_timer_expiry() {
        let vm = create_vm_with_id(101, 1);
        let mut vcpu = ready_vcpu(&vm, 0);
        with_state(|s| s.arm_timer = Some(Duration::from_millis(20)));

        script([gspr(IDLE)]);
        assert_eq!(vcpu.run().unwrap(), LaVCpuExitReason::Interrupted);
        assert_eq!(vcpu.pc(), ENTRY + 4);
        assert_eq!(vcpu.stats().idle_exits, 1);

        let log = call_log();
        assert!(position(&log, "wait_for_wakeup").is_some());
        assert_eq!(position(&log, "wakeup_timeout"), None);
    }

    #[test]
    fn test_idle_with_pending_interrupt_does_not_block() {
        let vm = create_vm(1);
        let mut vcpu = ready_vcpu(&vm, 0);
        vm.inject_interrupt(0, irq::TI as i32).unwrap();

        script([gspr(IDLE)]);
        assert_eq!(vcpu.run().unwrap(), LaVCpuExitReason::Interrupted);

        let log = call_log();
        assert_eq!(position(&log, "timer_to_software"), None);
        assert_eq!(position(&log, "wait_for_wakeup"), None);
        assert_eq!(vcpu.pc(), ENTRY + 4);
        // The timer interrupt was live in ESTAT at the idle.
        assert_eq!(entries()[0].estat, 1 << 11);
    }

    #[test]
    fn test_unrecognized_instruction_restores_pc() {
        let vm = create_vm(1);
        let mut vcpu = ready_vcpu(&vm, 0);

        for word in [0xff00_0000u32, 0x0640_0000, 0x0700_0000, 0x0000_0400] {
            script([gspr(word)]);
            let exit = vcpu.run().unwrap();
            assert_eq!(
                exit,
                LaVCpuExitReason::InternalError {
                    kind: InternalErrorKind::UnsupportedInstruction,
                    pc: ENTRY,
                    inst: word,
                }
            );
            assert_eq!(vcpu.pc(), ENTRY);
            assert_eq!(vcpu.state(), VCpuState::Ready);
        }
    }

    #[test]
    fn test_cache_op_is_skipped() {
        let vm = create_vm(1);
        let mut vcpu = ready_vcpu(&vm, 0);

        script([gspr(CACOP | (5 << 5) | 0x10)]);
        assert_eq!(vcpu.run().unwrap(), LaVCpuExitReason::Interrupted);
        assert_eq!(vcpu.pc(), ENTRY + 4);

        let entries = entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].pc, ENTRY + 4);
        // Binding made every hardware CSR dirty; nothing changed since.
        assert!(entries[0].dirty >= 38);
        assert_eq!(entries[1].dirty, 0);
    }

    #[test]
    fn test_cpucfg_hides_virtualization_features() {
        let vm = create_vm(1);
        let mut vcpu = ready_vcpu(&vm, 0);
        vcpu.set_gpr(5, 2);
        vcpu.set_gpr(7, 6);
        vcpu.set_gpr(9, 0);
        vcpu.set_gpr(11, 1000);

        script([
            gspr(cpucfg(4, 5)),
            gspr(cpucfg(6, 7)),
            gspr(cpucfg(8, 9)),
            gspr(cpucfg(10, 11)),
            gspr(cpucfg(0, 5)),
        ]);
        assert_eq!(vcpu.run().unwrap(), LaVCpuExitReason::Interrupted);

        assert_eq!(vcpu.gpr(4), (u32::MAX & !(0xf << 10)) as u64);
        assert_eq!(vcpu.gpr(6), (u32::MAX & !0x7fff) as u64);
        assert_eq!(vcpu.gpr(8), 0x0014_c010);
        assert_eq!(vcpu.gpr(10), 0);
        assert_eq!(vcpu.gpr(0), 0);
        assert_eq!(vcpu.pc(), ENTRY + 20);
        assert_eq!(vcpu.stats().cpucfg_exits, 5);
    }

    #[test]
    fn test_csr_instructions() {
        let vm = create_vm(1);
        let mut vcpu = ready_vcpu(&vm, 0);
        vcpu.set_gpr(4, 0x1234);

        script([
            // csrwr $r4, KS0
            gspr(csr_op(4, 1, csr::KS0)),
            // csrrd $r6, KS0
            gspr(csr_op(6, 0, csr::KS0)),
        ]);
        vcpu.run().unwrap();
        assert_eq!(vcpu.gpr(4), 0);
        assert_eq!(vcpu.gpr(6), 0x1234);
        assert_eq!(vcpu.csr().read(csr::KS0), 0x1234);
        assert_eq!(vcpu.stats().csr_exits, 2);
        assert_eq!(vcpu.pc(), ENTRY + 8);
    }

    #[test]
    fn test_estat_split_storage_across_paths() {
        let vm = create_vm(1);
        let mut vcpu = ready_vcpu(&vm, 0);
        let estat_id = OneRegId::Csr(csr::ESTAT);

        vcpu.set_one_reg(estat_id, 0x3fd).unwrap();
        assert_eq!(vcpu.csr().gintc(), 0xff);
        assert_eq!(vcpu.csr().raw_estat(), 0x1);
        assert_eq!(vcpu.get_one_reg(estat_id).unwrap(), 0x3fd);

        // csrxchg $r7, $r8, ESTAT clearing bits 2 and 3
        vcpu.set_gpr(7, 0);
        vcpu.set_gpr(8, 0xc);
        script([gspr(csr_op(7, 8, csr::ESTAT))]);
        vcpu.run().unwrap();

        assert_eq!(vcpu.gpr(7), 0xc);
        assert_eq!(vcpu.csr().gintc(), 0xfc);
        assert_eq!(vcpu.get_one_reg(estat_id).unwrap(), 0x3f1);
        // The hardware saw the split value at the next entry.
        let last = entries().last().cloned().unwrap();
        assert_eq!(last.gintc, 0xfc);
        assert_eq!(last.estat, 0x1);
    }

    #[test]
    fn test_unsupported_csr_reads_zero() {
        let vm = create_vm(1);
        let mut vcpu = ready_vcpu(&vm, 0);
        vcpu.set_gpr(9, 0x55);
        vcpu.set_gpr(10, 0x66);

        script([
            gspr(csr_op(9, 0, 0x9)),
            gspr(csr_op(10, 1, 0x9)),
            gspr(csr_op(9, 0, 0x9)),
        ]);
        assert_eq!(vcpu.run().unwrap(), LaVCpuExitReason::Interrupted);

        assert_eq!(vcpu.gpr(9), 0);
        assert_eq!(vcpu.gpr(10), 0);
        assert_eq!(vcpu.csr().read(0x9), 0);
        assert_eq!(vcpu.csr().reported_ids(), vec![0x9]);
        assert_eq!(vcpu.pc(), ENTRY + 12);
        assert_eq!(vcpu.get_one_reg(OneRegId::Csr(0x9)), Err(AxError::InvalidInput));
        assert_eq!(vcpu.set_one_reg(OneRegId::Csr(0x9), 1), Err(AxError::InvalidInput));
    }

    #[test]
    fn test_mmio_read_round_trip() {
        let vm = create_vm(1);
        let mut vcpu = ready_vcpu(&vm, 0);
        let addr = MMIO_BASE + 0x10;

        script([exit_with(exccode::PIL, addr, ld_w(4, 5))]);
        let exit = vcpu.run().unwrap();
        assert_eq!(
            exit,
            LaVCpuExitReason::Mmio(IoRequest {
                addr,
                width: AccessWidth::Dword,
                is_write: false,
                data: [0; 8],
            })
        );
        // Nothing is written and PC stays until the host answers.
        assert_eq!(vcpu.pc(), ENTRY);
        assert_eq!(vcpu.gpr(4), 0);

        let data = vcpu.io_data_mut().unwrap();
        assert_eq!(data.len(), 4);
        data.copy_from_slice(&0x8000_0000u32.to_le_bytes());

        script([exit_with(exccode::PIL, addr, ld_bu(6, 5))]);
        let exit = vcpu.run().unwrap();
        assert_eq!(vcpu.gpr(4), 0xffff_ffff_8000_0000);
        assert_eq!(vcpu.pc(), ENTRY + 4);
        assert!(matches!(exit, LaVCpuExitReason::Mmio(req) if req.width == AccessWidth::Byte));

        vcpu.io_data_mut().unwrap()[0] = 0xff;
        script([]);
        assert_eq!(vcpu.run().unwrap(), LaVCpuExitReason::Interrupted);
        assert_eq!(vcpu.gpr(6), 0xff);
        assert_eq!(vcpu.pc(), ENTRY + 8);
        assert_eq!(vcpu.stats().mmio_exits, 2);
        assert!(call_log().contains(&format!("page_fault({:#x}, false)", addr)));
    }

    #[test]
    fn test_mmio_write() {
        let vm = create_vm(1);
        let mut vcpu = ready_vcpu(&vm, 0);
        vcpu.set_gpr(4, 0x1122_3344_5566_7788);

        script([exit_with(exccode::PIS, MMIO_BASE, st_w(4, 5))]);
        let exit = vcpu.run().unwrap();
        assert_eq!(
            exit,
            LaVCpuExitReason::Mmio(IoRequest {
                addr: MMIO_BASE,
                width: AccessWidth::Dword,
                is_write: true,
                data: [0x88, 0x77, 0x66, 0x55, 0, 0, 0, 0],
            })
        );
        assert_eq!(vcpu.pc(), ENTRY + 4);
        assert!(vcpu.io_data_mut().is_none());

        script([]);
        assert_eq!(vcpu.run().unwrap(), LaVCpuExitReason::Interrupted);
        assert_eq!(vcpu.pc(), ENTRY + 4);
        assert_eq!(vcpu.gpr(4), 0x1122_3344_5566_7788);
        assert!(vcpu.pending_io().is_none());
    }

    #[test]
    fn test_mmio_unsupported_instruction() {
        let vm = create_vm(1);
        let mut vcpu = ready_vcpu(&vm, 0);

        // A load reported as a store fault.
        script([exit_with(exccode::PIS, MMIO_BASE, ld_w(4, 5))]);
        let exit = vcpu.run().unwrap();
        assert_eq!(
            exit,
            LaVCpuExitReason::InternalError {
                kind: InternalErrorKind::UnsupportedMmioInstruction,
                pc: ENTRY,
                inst: ld_w(4, 5),
            }
        );
        assert_eq!(vcpu.pc(), ENTRY);
        assert!(vcpu.pending_io().is_none());
    }

    #[test]
    fn test_resolved_page_fault_resumes_guest() {
        let vm = create_vm(1);
        let mut vcpu = ready_vcpu(&vm, 0);

        script([
            exit_with(exccode::PIL, 0x2000, ld_w(4, 5)),
            exit_with(exccode::PME, 0x3000, st_w(4, 5)),
        ]);
        assert_eq!(vcpu.run().unwrap(), LaVCpuExitReason::Interrupted);

        let log = call_log();
        assert!(log.contains(&"page_fault(0x2000, false)".to_string()));
        assert!(log.contains(&"page_fault(0x3000, true)".to_string()));
        assert_eq!(vcpu.pc(), ENTRY);
        assert_eq!(vcpu.stats().mmio_exits, 0);
        assert_eq!(entries().len(), 3);
    }

    #[test]
    fn test_instruction_fetch_fault_is_internal_error() {
        let vm = create_vm(1);
        let mut vcpu = ready_vcpu(&vm, 0);

        script([exit_with(exccode::PIF, MMIO_BASE, 0)]);
        assert_eq!(
            vcpu.run().unwrap(),
            LaVCpuExitReason::InternalError {
                kind: InternalErrorKind::InstructionFetchFault,
                pc: ENTRY,
                inst: 0,
            }
        );

        // A load-class fault on the PC itself is a fetch too.
        vcpu.set_regs(&LaRegs {
            gpr: [0; 32],
            pc: MMIO_BASE + 0x40,
        });
        script([exit_with(exccode::PIL, MMIO_BASE + 0x40, ld_w(1, 2))]);
        assert!(matches!(
            vcpu.run().unwrap(),
            LaVCpuExitReason::InternalError {
                kind: InternalErrorKind::InstructionFetchFault,
                ..
            }
        ));
        assert!(vcpu.pending_io().is_none());
    }

    #[test]
    fn test_iocsr_round_trip() {
        let vm = create_vm(1);
        let mut vcpu = ready_vcpu(&vm, 0);
        vcpu.set_gpr(5, 0x420);
        vcpu.set_gpr(6, 0xdead_beef_0000_0001);

        script([gspr(iocsrrd_w(4, 5))]);
        let exit = vcpu.run().unwrap();
        assert_eq!(
            exit,
            LaVCpuExitReason::Iocsr(IoRequest {
                addr: 0x420,
                width: AccessWidth::Dword,
                is_write: false,
                data: [0; 8],
            })
        );
        // PC moved at the trap.
        assert_eq!(vcpu.pc(), ENTRY + 4);

        vcpu.io_data_mut()
            .unwrap()
            .copy_from_slice(&0xffff_fffeu32.to_le_bytes());
        script([gspr(iocsrwr_d(6, 5))]);
        let exit = vcpu.run().unwrap();
        assert_eq!(vcpu.gpr(4), 0xffff_ffff_ffff_fffe);
        match exit {
            LaVCpuExitReason::Iocsr(req) => {
                assert!(req.is_write);
                assert_eq!(req.addr, 0x420);
                assert_eq!(req.value(), 0xdead_beef_0000_0001);
                assert_eq!(req.data().len(), 8);
            }
            other => panic!("unexpected exit {:?}", other),
        }
        assert_eq!(vcpu.pc(), ENTRY + 8);

        script([]);
        assert_eq!(vcpu.run().unwrap(), LaVCpuExitReason::Interrupted);
        assert_eq!(vcpu.pc(), ENTRY + 8);
        assert_eq!(vcpu.stats().iocsr_exits, 2);
    }

    #[test]
    fn test_fpu_double_grant_is_internal_error() {
        let vm = create_vm(1);
        let mut vcpu = ready_vcpu(&vm, 0);
        let fpd = exit_with(exccode::FPD, 0, 0);

        script([fpd, fpd]);
        let exit = vcpu.run().unwrap();
        assert_eq!(
            exit,
            LaVCpuExitReason::InternalError {
                kind: InternalErrorKind::FpuAlreadyOwned,
                pc: ENTRY,
                inst: 0,
            }
        );
        assert!(!vcpu.fpu_owned());
        let log = call_log();
        let restores = log.iter().filter(|e| e.starts_with("restore_fpu")).count();
        assert_eq!(restores, 1);
        assert_eq!(position(&log, "save_fpu@0"), Some(log.len() - 1));

        vcpu.unbind().unwrap();
        assert_eq!(call_log().len(), log.len());
        assert_eq!(vcpu.get_fpu().fcsr, 0x50);
    }

    #[test]
    fn test_fpu_released_before_returning_to_host() {
        let vm = create_vm(2);
        let mut vcpu = ready_vcpu(&vm, 0);
        let fpd = exit_with(exccode::FPD, 0, 0);

        script([fpd]);
        assert_eq!(vcpu.run().unwrap(), LaVCpuExitReason::Interrupted);
        assert!(!vcpu.fpu_owned());
        assert!(position(&call_log(), "save_fpu@0").is_some());

        // The host moved the thread before the next run.
        with_state(|s| s.cpu = 1);
        script([fpd]);
        assert_eq!(vcpu.run().unwrap(), LaVCpuExitReason::Interrupted);

        let log = call_log();
        let restore = position(&log, "restore_fpu(0x50)@1").unwrap();
        let save = position(&log, "save_fpu@1").unwrap();
        assert!(restore < save);
        let saves = log.iter().filter(|e| e.starts_with("save_fpu")).count();
        assert_eq!(saves, 2);
        assert_eq!(vcpu.get_fpu().fcsr, 0x51);
    }

    #[test]
    fn test_fpu_transfer() {
        let vm = create_vm(1);
        let mut vcpu = ready_vcpu(&vm, 0);
        let mut fpu = FpuContext::default();
        fpu.fpr[3] = 0x4000_0000_0000_0000;
        fpu.fcc = 0x0101;
        vcpu.set_fpu(&fpu);
        assert_eq!(vcpu.get_fpu(), fpu);
        assert!(!call_log().iter().any(|e| e.starts_with("save_fpu")));
    }

    #[test]
    fn test_unknown_exit_code() {
        let vm = create_vm(1);
        let mut vcpu = ready_vcpu(&vm, 0);
        let exit = exit_with(0x8, 0, 0);

        script([exit]);
        assert_eq!(
            vcpu.run().unwrap(),
            LaVCpuExitReason::Unknown {
                exccode: 0x8,
                estat: exit.estat,
            }
        );
        assert_eq!(vcpu.pc(), ENTRY);
    }

    #[test]
    fn test_interrupt_delivery_before_entry() {
        let vm = create_vm(1);
        let mut vcpu = ready_vcpu(&vm, 0);

        vm.inject_interrupt(0, (irq::HWI0 + 1) as i32).unwrap();
        vm.inject_interrupt(0, irq::IPI as i32).unwrap();
        script([]);
        vcpu.run().unwrap();
        let first = entries()[0].clone();
        assert_eq!(first.gintc, 1 << 1);
        assert_eq!(first.estat, 1 << 12);
        assert_eq!(vcpu.csr().read(csr::ESTAT), (1 << 12) | (1 << 3));

        vm.inject_interrupt(0, -((irq::HWI0 + 1) as i32)).unwrap();
        script([]);
        vcpu.run().unwrap();
        let last = entries().last().cloned().unwrap();
        assert_eq!(last.gintc, 0);
        assert_eq!(last.estat, 1 << 12);
        assert_eq!(vcpu.stats().int_exits, 2);
    }

    #[test]
    fn test_inject_interrupt_rules() {
        let vm = create_vm(1);
        let _vcpu = vm.create_vcpu(0, LaVCpuCreateConfig::default()).unwrap();

        assert_eq!(vm.inject_interrupt(0, 0), Err(AxError::InvalidInput));
        assert_eq!(vm.inject_interrupt(7, 1), Err(AxError::NotFound));
        assert_eq!(vm.inject_interrupt(0, 14), Err(AxError::InvalidInput));
        assert_eq!(vm.inject_interrupt(0, i32::MIN), Err(AxError::InvalidInput));

        let signals = vm.vcpu_signals(0).unwrap();
        vm.inject_interrupt(0, irq::TI as i32).unwrap();
        assert!(signals.has_pending());
        assert!(signals.take_kick());

        vm.inject_interrupt(0, -(irq::TI as i32)).unwrap();
        assert!(!signals.has_pending());
        assert!(signals.take_kick());
    }

    #[test]
    fn test_vpid_migration() {
        let vm = create_vm(2);
        let mut vcpu = ready_vcpu(&vm, 0);

        script([]);
        vcpu.run().unwrap();
        assert_eq!(vcpu.vpid(), 0x101);
        assert_eq!(entries()[0].vpid, 1);

        // Same CPU, same generation: the tag is kept.
        script([]);
        vcpu.run().unwrap();
        assert_eq!(vcpu.vpid(), 0x101);

        // Moving to CPU 1 reloads the vCPU and allocates there.
        with_state(|s| s.cpu = 1);
        script([]);
        vcpu.run().unwrap();
        assert_eq!(vcpu.vpid(), 0x101);
        assert_eq!(vm.contexts().get(1).unwrap().vpid_cache(), 0x101);
        assert_eq!(vm.contexts().get(1).unwrap().last_vcpu(), Some(0));
        assert!(entries().last().unwrap().dirty >= 38);

        // Back on CPU 0 the old tag is stale.
        with_state(|s| s.cpu = 0);
        script([]);
        vcpu.run().unwrap();
        assert_eq!(vcpu.vpid(), 0x102);
        assert_eq!(with_state(|s| s.flushes), 0);
    }

    #[test]
    fn test_vpid_generation_wrap_flushes() {
        let vm = create_vm(1);
        let mut a = ready_vcpu(&vm, 0);
        let mut b = ready_vcpu(&vm, 1);

        script([]);
        a.run().unwrap();
        assert_eq!(a.vpid(), 0x101);

        vm.contexts().get(0).unwrap().set_vpid_cache(0x1ff);
        script([]);
        b.run().unwrap();
        assert_eq!(b.vpid(), 0x201);
        assert_eq!(entries().last().unwrap().vpid, 1);
        assert_eq!(with_state(|s| s.flushes), 1);

        // The new generation invalidates a's tag without another flush.
        script([]);
        a.run().unwrap();
        assert_eq!(a.vpid(), 0x202);
        assert_eq!(with_state(|s| s.flushes), 1);
    }

    #[test]
    fn test_tlb_flush_request_drops_vpid() {
        let vm = create_vm(1);
        let mut vcpu = ready_vcpu(&vm, 0);

        script([]);
        vcpu.run().unwrap();
        assert_eq!(vcpu.vpid(), 0x101);

        vm.request_tlb_flush(0).unwrap();
        script([]);
        vcpu.run().unwrap();
        assert_eq!(vcpu.vpid(), 0x102);
        assert_eq!(entries().last().unwrap().vpid, 2);
    }

    #[test]
    fn test_destroy_clears_per_cpu_references() {
        let vm = create_vm(2);
        with_state(|s| s.cpu = 1);
        let vcpu = ready_vcpu(&vm, 3);
        assert_eq!(vm.contexts().get(1).unwrap().last_vcpu(), Some(3));

        drop(vcpu);
        assert_eq!(vm.contexts().get(1).unwrap().last_vcpu(), None);
        assert_eq!(vm.vcpu_signals(3).err(), Some(AxError::NotFound));

        // The id can be reused.
        let vcpu = ready_vcpu(&vm, 3);
        assert_eq!(vcpu.state(), VCpuState::Ready);
    }

    #[test]
    fn test_counter_offset_set_by_first_vcpu() {
        let vm = create_vm(1);
        let mut vcpu0 = vm.create_vcpu(0, LaVCpuCreateConfig::default()).unwrap();
        let mut vcpu1 = vm.create_vcpu(1, LaVCpuCreateConfig::default()).unwrap();

        with_state(|s| s.counter = 1000);
        vcpu0.set_one_reg(OneRegId::Counter, 5000).unwrap();
        assert_eq!(vcpu0.get_one_reg(OneRegId::Counter).unwrap(), 5000);

        with_state(|s| s.counter = 1500);
        assert_eq!(vcpu0.get_one_reg(OneRegId::Counter).unwrap(), 5500);

        vcpu1.set_one_reg(OneRegId::Counter, 1).unwrap();
        assert_eq!(vcpu1.get_one_reg(OneRegId::Counter).unwrap(), 5500);

        // Offsets below the host counter wrap.
        vcpu0.set_one_reg(OneRegId::Counter, 500).unwrap();
        assert_eq!(vm.guest_counter(), 500);
    }

    #[test]
    fn test_reset_register() {
        let vm = create_vm(1);
        let mut vcpu = ready_vcpu(&vm, 0);

        vcpu.set_one_reg(OneRegId::Csr(csr::TCFG), 0x1000_0001).unwrap();
        vm.inject_interrupt(0, irq::TI as i32).unwrap();
        vm.inject_interrupt(0, -(irq::IPI as i32)).unwrap();
        assert!(vcpu.signals().has_pending());

        let raw = OneRegId::VCpuReset.to_raw();
        vcpu.set_one_reg(OneRegId::from_raw(raw).unwrap(), 0).unwrap();
        assert!(!vcpu.signals().has_pending());
        assert_eq!(vcpu.csr().read(csr::TCFG), 0);
        assert_eq!(vcpu.get_one_reg(OneRegId::VCpuReset), Err(AxError::InvalidInput));

        // Nothing is left to deliver.
        script([]);
        vcpu.run().unwrap();
        assert_eq!(entries()[0].estat, 0);
    }

    #[test]
    fn test_immediate_exit_completes_pending_read() {
        let vm = create_vm(1);
        let mut vcpu = ready_vcpu(&vm, 0);

        script([exit_with(exccode::PNR, MMIO_BASE, ld_bu(4, 5))]);
        assert!(matches!(vcpu.run().unwrap(), LaVCpuExitReason::Mmio(_)));
        vcpu.io_data_mut().unwrap()[0] = 0x80;
        let entered = entries().len();

        vcpu.set_immediate_exit(true);
        assert_eq!(vcpu.run().unwrap(), LaVCpuExitReason::Interrupted);
        assert_eq!(entries().len(), entered);
        assert_eq!(vcpu.gpr(4), 0x80);
        assert_eq!(vcpu.pc(), ENTRY + 4);
        assert_eq!(vcpu.stats().signal_exits, 1);
    }

    #[test]
    fn test_register_transfer() {
        let vm = create_vm(1);
        let mut vcpu = vm.create_vcpu(0, LaVCpuCreateConfig::default()).unwrap();

        let mut regs = LaRegs::default();
        for (i, reg) in regs.gpr.iter_mut().enumerate() {
            *reg = 0x100 + i as u64;
        }
        regs.pc = 0x8000;
        vcpu.set_regs(&regs);

        let read = vcpu.get_regs();
        assert_eq!(read.gpr[0], 0);
        assert_eq!(&read.gpr[1..], &regs.gpr[1..]);
        assert_eq!(read.pc, 0x8000);

        vcpu.set_gpr(0, 5);
        vcpu.set_gpr(40, 5);
        assert_eq!(vcpu.gpr(0), 0);
        assert_eq!(vcpu.gpr(40), 0);
    }

    #[test]
    fn test_mp_state() {
        let vm = create_vm(1);
        let mut vcpu = vm.create_vcpu(0, LaVCpuCreateConfig::default()).unwrap();

        vcpu.set_mp_state(MpState::Stopped);
        assert_eq!(vcpu.mp_state(), MpState::Stopped);
        vm.inject_interrupt(0, irq::SWI0 as i32 + 1).unwrap();
        assert!(!vcpu.is_runnable());

        vcpu.set_mp_state(MpState::Runnable);
        assert!(vcpu.is_runnable());
    }

    #[test]
    fn test_nmi_alone_does_not_make_vcpu_runnable() {
        let vm = create_vm(1);
        let vcpu = vm.create_vcpu(0, LaVCpuCreateConfig::default()).unwrap();

        vm.inject_interrupt(0, irq::NMI as i32).unwrap();
        assert!(!vcpu.is_runnable());

        vm.inject_interrupt(0, irq::IPI as i32).unwrap();
        assert!(vcpu.is_runnable());
    }
}
