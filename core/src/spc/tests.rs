use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::*;
use crate::scsi::{
    ABORT, BUS_DEVICE_RESET, COMMAND_COMPLETE, MESSAGE_REJECT, READ_6, READ_10, REQUEST_SENSE,
    STATUS_CHECK_CONDITION, STATUS_GOOD, ScsiDevice, TEST_UNIT_READY, WRITE_10, identify,
};
use crate::sim::disk::{DISK_BLOCKSIZE, SimDisk};
use crate::sim::target::{ASC_LBA_OUT_OF_RANGE, SENSE_ILLEGAL_REQUEST};
use crate::sim::{SimPhase, SimSpc, TargetConfig, pump};
use crate::types::ScsiId;

const DISK_BLOCKS: usize = 64;

fn host_with(targets: &[(ScsiId, TargetConfig)]) -> SpcHost<SimSpc> {
    let sim = SimSpc::new();
    for &(id, config) in targets {
        sim.attach(id, SimDisk::new(DISK_BLOCKS), config).unwrap();
    }
    SpcHost::probe(sim, SpcPlatformData::default()).unwrap()
}

fn disconnecting() -> TargetConfig {
    TargetConfig {
        disconnect: true,
        ..Default::default()
    }
}

/// Collects completed commands
#[derive(Clone, Default)]
struct Completions(Arc<Mutex<Vec<Command>>>);

impl Completions {
    fn track(&self, cmd: Command) -> Command {
        let done = self.clone();
        cmd.with_done(move |c| done.0.lock().unwrap().push(c))
    }

    fn ids(&self) -> Vec<CommandId> {
        self.0.lock().unwrap().iter().map(Command::id).collect()
    }

    fn take(&self, id: CommandId) -> Command {
        let mut v = self.0.lock().unwrap();
        let idx = v.iter().position(|c| c.id() == id).unwrap();
        v.remove(idx)
    }
}

fn tur(c: &Completions, id: CommandId, target: ScsiId) -> Command {
    c.track(Command::new(id, ScsiDevice::new(target, 0), &[TEST_UNIT_READY, 0, 0, 0, 0, 0]).unwrap())
}

fn read6(c: &Completions, id: CommandId, dev: ScsiDevice, lba: u8, blocks: u8) -> Command {
    c.track(
        Command::new(id, dev, &[READ_6, 0, 0, lba, blocks, 0])
            .unwrap()
            .with_data_in(vec![vec![0; usize::from(blocks) * DISK_BLOCKSIZE]]),
    )
}

fn pattern(lba: usize, blocks: usize) -> Vec<u8> {
    (lba * DISK_BLOCKSIZE..(lba + blocks) * DISK_BLOCKSIZE)
        .map(SimDisk::pattern)
        .collect()
}

fn assert_good(cmd: &Command) {
    assert_eq!(cmd.result().host_byte(), Some(HostByte::DidOk), "{:?}", cmd);
    assert_eq!(cmd.result().status(), STATUS_GOOD);
    assert_eq!(cmd.result().message(), COMMAND_COMPLETE);
}

#[test]
fn round_trip() {
    let host = host_with(&[(1, TargetConfig::default())]);
    let c = Completions::default();

    for id in 0..5 {
        host.queue_command(read6(&c, id, ScsiDevice::new(1, 0), id as u8, 1)).unwrap();
    }
    assert_eq!(host.outstanding(), 5);

    pump(&host);

    assert_eq!(c.ids(), vec![0, 1, 2, 3, 4]);
    for id in 0..5 {
        let cmd = c.take(id);
        assert_good(&cmd);
        assert_eq!(cmd.transferred(), DISK_BLOCKSIZE);
        assert_eq!(cmd.data_flat(), pattern(id as usize, 1));
        assert!(!cmd.phase().not_issued());
        assert!(cmd.phase().identified());
    }
    assert_eq!(host.outstanding(), 0);
    assert_eq!(host.port().executed().len(), 5);
    assert_eq!(host.port().phase(), SimPhase::Free);
}

#[test]
fn queue_exclusivity() {
    let host = host_with(&[(1, TargetConfig::default())]);
    let c = Completions::default();

    for id in 1..=3 {
        host.queue_command(tur(&c, id, 1)).unwrap();
    }
    // First command is selecting, the others wait
    assert_eq!(host.current_id(), Some(1));
    assert_eq!(host.issue_len(), 2);
    assert_eq!(host.disconnected_len(), 0);
    assert_eq!(host.outstanding(), 3);
    assert!(!host.data().issue.contains(1));

    pump(&host);
    assert_eq!(host.current_id(), None);
    assert_eq!(host.issue_len(), 0);
    assert_eq!(host.outstanding(), 0);
    assert_eq!(c.ids(), vec![1, 2, 3]);
}

#[test]
fn disconnect_reconnect_read() {
    let host = host_with(&[(2, disconnecting())]);
    let c = Completions::default();
    let sim = host.port().clone();

    sim.hold_reselection(true);
    host.queue_command(read6(&c, 1, ScsiDevice::new(2, 0), 4, 1)).unwrap();
    pump(&host);

    assert!(c.ids().is_empty());
    assert_eq!(host.current_id(), None);
    assert_eq!(host.disconnected_len(), 1);
    assert_eq!(host.issue_len(), 0);
    assert_eq!(host.outstanding(), 1);
    assert_eq!(sim.disconnected_nexuses(), 1);
    assert!(host.dump().contains("Disconnected:\n  Command 1:"));

    sim.hold_reselection(false);
    pump(&host);

    let cmd = c.take(1);
    assert_good(&cmd);
    assert_eq!(cmd.transferred(), DISK_BLOCKSIZE);
    assert_eq!(cmd.resid(), 0);
    assert_eq!(cmd.data_flat(), pattern(4, 1));
    assert!(!cmd.phase().disconnected());
    assert_eq!(host.disconnected_len(), 0);
    assert_eq!(host.outstanding(), 0);
    assert_eq!(sim.msgout_log(), vec![identify(true, 0)]);
}

#[test]
fn interleaved_disconnects() {
    let host = host_with(&[(2, disconnecting()), (3, disconnecting())]);
    let c = Completions::default();

    host.queue_command(read6(&c, 1, ScsiDevice::new(2, 0), 0, 2)).unwrap();
    host.queue_command(read6(&c, 2, ScsiDevice::new(3, 0), 9, 1)).unwrap();
    let tur_lun1 = Command::new(3, ScsiDevice::new(2, 1), &[TEST_UNIT_READY, 0, 0, 0, 0, 0]).unwrap();
    host.queue_command(c.track(tur_lun1)).unwrap();
    pump(&host);

    assert_eq!(c.ids().len(), 3);
    let cmd = c.take(1);
    assert_good(&cmd);
    assert_eq!(cmd.data_flat(), pattern(0, 2));
    let cmd = c.take(2);
    assert_good(&cmd);
    assert_eq!(cmd.data_flat(), pattern(9, 1));
    assert_good(&c.take(3));
    assert_eq!(host.outstanding(), 0);
}

#[test]
fn selection_timeout() {
    let host = host_with(&[(1, TargetConfig::default())]);
    let c = Completions::default();

    host.queue_command(tur(&c, 1, 3)).unwrap();
    host.queue_command(tur(&c, 2, 1)).unwrap();
    pump(&host);

    let cmd = c.take(1);
    assert_eq!(cmd.result().host_byte(), Some(HostByte::DidNoConnect));
    assert_good(&c.take(2));
    assert_eq!(host.outstanding(), 0);
}

#[test]
fn bad_target() {
    let host = host_with(&[]);
    let c = Completions::default();

    host.queue_command(tur(&c, 1, 7)).unwrap();
    host.queue_command(tur(&c, 2, 9)).unwrap();

    for id in [1, 2] {
        assert_eq!(
            c.take(id).result().host_byte(),
            Some(HostByte::DidBadTarget)
        );
    }
    assert_eq!(host.outstanding(), 0);
    assert_eq!(host.issue_len(), 0);
}

#[test]
fn abort_in_issue_queue() {
    let host = host_with(&[(1, TargetConfig::default())]);
    let c = Completions::default();

    host.queue_command(tur(&c, 1, 1)).unwrap();
    host.queue_command(tur(&c, 2, 1)).unwrap();
    assert_eq!(host.abort(2), EhResult::Success);

    let aborted = c.take(2);
    assert_eq!(aborted.result().host_byte(), Some(HostByte::DidAbort));
    assert!(aborted.phase().not_issued());
    assert_eq!(host.issue_len(), 0);
    assert_eq!(host.outstanding(), 1);

    // Unknown command: nothing to do, still reported as success
    assert_eq!(host.abort(99), EhResult::Success);

    pump(&host);
    assert_good(&c.take(1));
    assert_eq!(host.outstanding(), 0);
    assert_eq!(host.port().executed().len(), 1);
}

#[test]
fn host_reset_keeps_soft_reset_device() {
    let soft = TargetConfig {
        disconnect: true,
        soft_reset: true,
        ..Default::default()
    };
    let host = host_with(&[(3, soft), (4, disconnecting())]);
    let c = Completions::default();
    let sim = host.port().clone();

    sim.hold_reselection(true);
    let d = ScsiDevice::new(3, 0).with_soft_reset(true);
    host.queue_command(read6(&c, 1, d, 1, 1)).unwrap();
    host.queue_command(read6(&c, 2, ScsiDevice::new(4, 0), 2, 1)).unwrap();
    pump(&host);
    assert_eq!(host.disconnected_len(), 2);
    assert_eq!(sim.disconnected_nexuses(), 2);

    assert_eq!(host.host_reset(), EhResult::Success);
    assert_eq!(c.ids(), vec![2]);
    assert_eq!(c.take(2).result().host_byte(), Some(HostByte::DidReset));
    assert_eq!(host.disconnected_len(), 1);
    assert_eq!(host.outstanding(), 1);
    assert_eq!(sim.disconnected_nexuses(), 1);

    sim.hold_reselection(false);
    pump(&host);

    let cmd = c.take(1);
    assert_good(&cmd);
    assert_eq!(cmd.data_flat(), pattern(1, 1));
    assert_eq!(host.outstanding(), 0);
}

#[test]
fn bus_reset_flushes_current_and_queued() {
    let host = host_with(&[(1, TargetConfig::default())]);
    let c = Completions::default();

    host.queue_command(tur(&c, 1, 1)).unwrap();
    host.queue_command(tur(&c, 2, 1)).unwrap();
    assert_eq!(host.bus_reset(), EhResult::Success);
    assert_eq!(c.ids(), vec![2]);

    // The selected command is caught by the reset condition
    pump(&host);
    assert_eq!(c.take(1).result().host_byte(), Some(HostByte::DidReset));
    assert_eq!(c.take(2).result().host_byte(), Some(HostByte::DidReset));
    assert_eq!(host.outstanding(), 0);
}

#[test]
fn extended_message_rejected() {
    let sdtr = TargetConfig {
        send_sdtr: true,
        ..Default::default()
    };
    let host = host_with(&[(1, sdtr)]);
    let c = Completions::default();

    host.queue_command(tur(&c, 1, 1)).unwrap();
    pump(&host);

    assert_good(&c.take(1));
    assert_eq!(host.port().rejected(), 1);
    assert_eq!(
        host.port().msgout_log(),
        vec![identify(true, 0), MESSAGE_REJECT]
    );
    assert_eq!(host.port().executed(), vec![vec![TEST_UNIT_READY, 0, 0, 0, 0, 0]]);
}

#[test]
fn reselection_without_match() {
    let host = host_with(&[(2, disconnecting())]);
    let c = Completions::default();
    let sim = host.port().clone();

    sim.hold_reselection(true);
    host.queue_command(read6(&c, 1, ScsiDevice::new(2, 0), 0, 1)).unwrap();
    pump(&host);
    assert_eq!(host.disconnected_len(), 1);

    // A target reconnects with a nexus the host never issued
    sim.inject_disconnected(5, 0);
    assert!(sim.reselect(5));
    pump(&host);

    assert_eq!(sim.msgout_log().last(), Some(&ABORT));
    assert!(c.ids().is_empty());
    assert_eq!(host.disconnected_len(), 1);
    assert_eq!(sim.disconnected_nexuses(), 1);

    sim.hold_reselection(false);
    pump(&host);
    assert_good(&c.take(1));
    assert_eq!(sim.disconnected_nexuses(), 0);
    assert_eq!(host.outstanding(), 0);
}

/// Commands held by the adapter, with their `not_issued` flag
fn not_issued_flags(host: &SpcHost<SimSpc>) -> Vec<(CommandId, bool)> {
    let engine = host.engine();
    let data = host.data();
    engine
        .current
        .iter()
        .chain(engine.done.iter())
        .chain(data.issue.iter())
        .chain(data.disconnected.iter())
        .map(|c| (c.id(), c.phase().not_issued()))
        .collect()
}

/// Like [pump], checking between interrupts that no command that made it
/// onto the bus is flagged as not issued again
fn pump_watching(host: &SpcHost<SimSpc>, issued: &mut HashSet<CommandId>) {
    let sim = host.port();
    for _ in 0..1000 {
        for (id, not_issued) in not_issued_flags(host) {
            if not_issued {
                assert!(!issued.contains(&id), "command {} not issued again", id);
            } else {
                issued.insert(id);
            }
        }

        if sim.irq_asserted() {
            host.interrupt();
        } else if !sim.try_reselect() && host.run_pending_work() == 0 {
            return;
        }
        host.run_pending_work();
    }
    panic!("bus did not settle");
}

#[test]
fn not_issued_cleared_once() {
    let host = host_with(&[(1, disconnecting()), (2, disconnecting())]);
    let c = Completions::default();
    let mut issued = HashSet::new();

    // Beyond the end of the disk, goes out again for REQUEST SENSE
    host.queue_command(read6(&c, 1, ScsiDevice::new(1, 0), 100, 1)).unwrap();
    host.queue_command(read6(&c, 2, ScsiDevice::new(2, 0), 0, 1)).unwrap();
    pump_watching(&host, &mut issued);

    assert_eq!(issued, HashSet::from([1, 2]));
    let cc = c.take(1);
    assert_eq!(cc.result().status(), STATUS_CHECK_CONDITION);
    assert_eq!(cc.sense()[2], SENSE_ILLEGAL_REQUEST);
    assert!(!cc.phase().not_issued());

    let read = c.take(2);
    assert_good(&read);
    assert!(!read.phase().not_issued());
    assert_eq!(host.port().executed().len(), 3);
    assert_eq!(host.outstanding(), 0);
}

#[test]
fn completion_calls_back_into_host() {
    let host = Arc::new(host_with(&[(1, TargetConfig::default())]));
    let (tx, rx) = crossbeam_channel::bounded(1);
    let weak = Arc::downgrade(&host);
    let cmd = Command::new(1, ScsiDevice::new(1, 0), &[TEST_UNIT_READY, 0, 0, 0, 0, 0])
        .unwrap()
        .with_done(move |c| {
            let host = weak.upgrade().unwrap();
            let _ = tx.send((c.result(), host.state(), host.current_id(), host.outstanding()));
        });
    host.queue_command(cmd).unwrap();

    let pumper = {
        let host = Arc::clone(&host);
        std::thread::spawn(move || {
            pump(&host);
        })
    };
    let (result, state, current, outstanding) =
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    pumper.join().unwrap();

    assert_eq!(result.host_byte(), Some(HostByte::DidOk));
    assert_eq!(state, SpcState::BusFree);
    assert_eq!(current, None);
    assert_eq!(outstanding, 0);
}

#[test]
fn completion_queues_follow_up() {
    let host = Arc::new(host_with(&[(1, TargetConfig::default())]));
    let c = Completions::default();
    let weak = Arc::downgrade(&host);
    let follow_up = tur(&c, 2, 1);
    let first = Command::new(1, ScsiDevice::new(1, 0), &[TEST_UNIT_READY, 0, 0, 0, 0, 0])
        .unwrap()
        .with_done(move |_| {
            weak.upgrade().unwrap().queue_command(follow_up).unwrap();
        });

    host.queue_command(first).unwrap();
    pump(&host);

    assert_good(&c.take(2));
    assert_eq!(host.port().executed().len(), 2);
    assert_eq!(host.outstanding(), 0);
}

#[test]
fn check_condition_auto_sense() {
    let host = host_with(&[(1, TargetConfig::default())]);
    let c = Completions::default();

    // Beyond the end of the disk
    host.queue_command(read6(&c, 1, ScsiDevice::new(1, 0), 100, 1)).unwrap();
    pump(&host);

    let cmd = c.take(1);
    assert_eq!(cmd.result().host_byte(), Some(HostByte::DidOk));
    assert_eq!(cmd.result().status(), STATUS_CHECK_CONDITION);
    assert_eq!(cmd.status(), STATUS_CHECK_CONDITION);
    assert_eq!(cmd.cdb()[0], READ_6);
    assert_eq!(cmd.resid(), DISK_BLOCKSIZE);

    let sense = cmd.sense();
    assert_eq!(sense.len(), 14);
    assert_eq!(sense[2], SENSE_ILLEGAL_REQUEST);
    assert_eq!(u16::from_be_bytes([sense[12], sense[13]]), ASC_LBA_OUT_OF_RANGE);

    let executed = host.port().executed();
    assert_eq!(executed.len(), 2);
    assert_eq!(executed[1], vec![REQUEST_SENSE, 0, 0, 0, 96, 0]);
    assert_eq!(host.outstanding(), 0);
}

#[test]
fn parity_error() {
    let parity = TargetConfig {
        parity_error: true,
        ..Default::default()
    };
    let host = host_with(&[(1, parity)]);
    let c = Completions::default();

    host.queue_command(read6(&c, 1, ScsiDevice::new(1, 0), 0, 1)).unwrap();
    host.queue_command(tur(&c, 2, 1)).unwrap();
    pump(&host);

    assert_eq!(c.take(1).result().host_byte(), Some(HostByte::DidParity));
    // Target was told to drop the transfer
    assert!(host.port().msgout_log().contains(&ABORT));
    assert_good(&c.take(2));
    assert_eq!(host.outstanding(), 0);
}

#[test]
fn reset_in() {
    let host = host_with(&[(2, disconnecting())]);
    let c = Completions::default();
    let sim = host.port().clone();

    sim.hold_reselection(true);
    host.queue_command(read6(&c, 1, ScsiDevice::new(2, 0), 0, 1)).unwrap();
    pump(&host);
    assert_eq!(host.disconnected_len(), 1);

    sim.assert_reset();
    pump(&host);

    assert_eq!(c.take(1).result().host_byte(), Some(HostByte::DidReset));
    assert_eq!(host.disconnected_len(), 0);
    assert_eq!(host.outstanding(), 0);
    assert_eq!(sim.disconnected_nexuses(), 0);
    assert_eq!(host.state(), SpcState::BusFree);
}

#[test]
fn write_then_read_back() {
    let host = host_with(&[(1, TargetConfig::default())]);
    let c = Completions::default();

    let mut expected = vec![0x5A; 200];
    expected.extend([0xA5; 312]);

    let write = Command::new(1, ScsiDevice::new(1, 0), &[WRITE_10, 0, 0, 0, 0, 3, 0, 0, 1, 0])
        .unwrap()
        .with_data_out(vec![vec![0x5A; 200], vec![0xA5; 312]]);
    host.queue_command(c.track(write)).unwrap();

    let read = Command::new(2, ScsiDevice::new(1, 0), &[READ_10, 0, 0, 0, 0, 3, 0, 0, 1, 0])
        .unwrap()
        .with_data_in(vec![vec![0; 100], vec![0; 12], vec![0; 400]]);
    host.queue_command(c.track(read)).unwrap();
    pump(&host);

    let write = c.take(1);
    assert_good(&write);
    assert_eq!(write.resid(), 0);

    let read = c.take(2);
    assert_good(&read);
    assert_eq!(read.data()[1].len(), 12);
    assert_eq!(read.data_flat(), expected);

    assert_eq!(host.port().with_target(1, |t| t.read(3, 1)), Some(expected));
}

#[test]
fn underrun_and_overrun() {
    let host = host_with(&[(1, TargetConfig::default())]);
    let c = Completions::default();

    // Buffer twice as large as the transfer
    let short = Command::new(1, ScsiDevice::new(1, 0), &[READ_6, 0, 0, 0, 1, 0])
        .unwrap()
        .with_data_in(vec![vec![0; 2 * DISK_BLOCKSIZE]]);
    host.queue_command(c.track(short)).unwrap();
    // Buffer too small, the rest goes to the bit bucket
    let long = Command::new(2, ScsiDevice::new(1, 0), &[READ_6, 0, 0, 0, 2, 0])
        .unwrap()
        .with_data_in(vec![vec![0; DISK_BLOCKSIZE]]);
    host.queue_command(c.track(long)).unwrap();
    pump(&host);

    let short = c.take(1);
    assert_good(&short);
    assert_eq!(short.transferred(), DISK_BLOCKSIZE);
    assert_eq!(short.resid(), DISK_BLOCKSIZE);

    let long = c.take(2);
    assert_good(&long);
    assert_eq!(long.resid(), 0);
    assert_eq!(long.data_flat(), pattern(0, 1));
}

#[test]
fn device_reset_disconnected() {
    let host = Arc::new(host_with(&[(2, disconnecting())]));
    let c = Completions::default();
    let sim = host.port().clone();

    sim.hold_reselection(true);
    host.queue_command(read6(&c, 1, ScsiDevice::new(2, 0), 0, 1)).unwrap();
    pump(&host);
    assert_eq!(host.disconnected_len(), 1);

    let stop = Arc::new(AtomicBool::new(false));
    let pumper = {
        let host = Arc::clone(&host);
        let stop = Arc::clone(&stop);
        std::thread::spawn(move || {
            while !stop.load(Ordering::Acquire) {
                pump(&host);
                std::thread::sleep(Duration::from_millis(1));
            }
        })
    };

    assert_eq!(host.device_reset(1), EhResult::Success);
    stop.store(true, Ordering::Release);
    pumper.join().unwrap();

    assert_eq!(c.take(1).result().host_byte(), Some(HostByte::DidReset));
    assert_eq!(host.outstanding(), 0);
    assert_eq!(host.disconnected_len(), 0);
    assert_eq!(sim.disconnected_nexuses(), 0);
    assert!(
        sim.msgout_log()
            .ends_with(&[identify(true, 0), BUS_DEVICE_RESET])
    );
}

#[test]
fn device_reset_unknown_command() {
    let host = host_with(&[(1, TargetConfig::default())]);
    assert_eq!(host.device_reset(42), EhResult::Failed);
    assert_eq!(host.outstanding(), 0);
}

#[test]
fn probe_rejects_bad_id() {
    let platform = SpcPlatformData {
        scsi_id: 8,
        ..Default::default()
    };
    assert!(SpcHost::probe(SimSpc::new(), platform).is_err());
}

#[test]
fn bios_geometry() {
    let host = host_with(&[]);
    assert_eq!(host.bios_param(2048 * 100), [64, 32, 100]);
    assert_eq!(host.bios_param(1000), [64, 32, 0]);
}

#[test]
fn platform_from_json() {
    let platform: SpcPlatformData =
        serde_json::from_str(r#"{ "scsi_id": 6, "reconnect": false }"#).unwrap();
    assert_eq!(platform.scsi_id, 6);
    assert!(!platform.reconnect);
    assert_eq!(platform.delay_ms, SpcPlatformData::default().delay_ms);
}

#[test]
fn no_reconnect_without_permission() {
    let host = SpcHost::probe(
        {
            let sim = SimSpc::new();
            sim.attach(2, SimDisk::new(DISK_BLOCKS), disconnecting()).unwrap();
            sim
        },
        SpcPlatformData {
            reconnect: false,
            ..Default::default()
        },
    )
    .unwrap();
    let c = Completions::default();

    host.port().hold_reselection(true);
    host.queue_command(read6(&c, 1, ScsiDevice::new(2, 0), 0, 1)).unwrap();
    pump(&host);

    // IDENTIFY without disconnect privilege, the target stays on the bus
    assert_good(&c.take(1));
    assert_eq!(host.port().msgout_log(), vec![identify(false, 0)]);
    assert_eq!(host.port().disconnected_nexuses(), 0);
}
