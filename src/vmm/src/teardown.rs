// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Replaces the C original's `atexit` + bare `SIGTERM` handler with an
//! explicit scoped owner: a [`Teardown`] value held by `main`, whose
//! `Drop` signals every peer vCPU thread, joins them, optionally dumps
//! the kernel log, and releases the VM/KVM descriptors in acquisition
//! order.
//!
//! The signal handler itself does nothing but let `KVM_RUN` return
//! `EINTR` -- it sets a thread-local flag so the interrupted thread's
//! own dispatch loop decides to stop, rather than acting from inside
//! the handler.

use std::cell::Cell;
use std::os::unix::thread::JoinHandleExt;
use std::sync::Arc;
use std::thread::JoinHandle;

use kvm_ioctls::{Kvm, VmFd};
use vmm_sys_util::signal::register_signal_handler;

/// Delivered to ask a peer vCPU thread to stop.
pub const TEARDOWN_SIGNAL: libc::c_int = libc::SIGTERM;

thread_local! {
    static SHUTDOWN_REQUESTED: Cell<bool> = Cell::new(false);
}

extern "C" fn handle_teardown_signal(_: libc::c_int) {
    // Not strictly async-signal-safe (TLS access), but this handler
    // only ever runs on a vCPU thread we are in the middle of tearing
    // down, never re-entrantly.
    SHUTDOWN_REQUESTED.with(|flag| flag.set(true));
}

/// True once this thread has received the teardown signal. Checked by
/// [`crate::cpu::Vcpu::run`] after an `EINTR` from `KVM_RUN`.
pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.with(Cell::get)
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to install the teardown signal handler: {0}")]
    SignalHandler(#[source] vmm_sys_util::errno::Error),
}

/// Installs the teardown signal handler. Must happen before any vCPU
/// thread is created so every peer inherits the disposition.
pub fn install_handler() -> Result<(), Error> {
    unsafe { register_signal_handler(TEARDOWN_SIGNAL, handle_teardown_signal) }
        .map_err(Error::SignalHandler)
}

/// Owns the process-wide KVM/VM handles and the peer vCPU thread
/// handles. Its `Drop` impl is the monitor's sole teardown path.
pub struct Teardown {
    pub peers: Vec<JoinHandle<crate::cpu::Result<i32>>>,
    pub vm_fd: Option<Arc<VmFd>>,
    pub kvm: Option<Kvm>,
    pub klog_addr: Option<u64>,
    pub mem: Option<Arc<crate::memory::GuestMemory>>,
    pub verbose: bool,
}

impl Teardown {
    pub fn new(vm_fd: Arc<VmFd>, kvm: Kvm) -> Self {
        Teardown {
            peers: Vec::new(),
            vm_fd: Some(vm_fd),
            kvm: Some(kvm),
            klog_addr: None,
            mem: None,
            verbose: false,
        }
    }
}

impl Drop for Teardown {
    fn drop(&mut self) {
        for handle in &self.peers {
            // SAFETY: `as_pthread_t` only reads the handle's stored
            // thread id.
            let tid = handle.as_pthread_t();
            unsafe {
                libc::pthread_kill(tid as libc::pthread_t, TEARDOWN_SIGNAL);
            }
        }

        for handle in self.peers.drain(..) {
            match handle.join() {
                Ok(Ok(_status)) => {}
                Ok(Err(crate::cpu::Error::Terminated)) => {}
                Ok(Err(e)) => eprintln!("peer vCPU exited with error: {}", e),
                Err(_) => eprintln!("peer vCPU thread panicked"),
            }
        }

        if self.verbose {
            if let (Some(mem), Some(addr)) = (&self.mem, self.klog_addr) {
                dump_kernel_log(mem, addr);
            }
        }

        // vm_fd and kvm drop here, in that order, releasing the
        // descriptors after every peer thread has released its own
        // vCPU fd.
    }
}

fn dump_kernel_log(mem: &crate::memory::GuestMemory, addr: u64) {
    const KLOG_SIZE: usize = 0x1000;
    if let Ok(bytes) = mem.slice_mut(addr, KLOG_SIZE) {
        let text = String::from_utf8_lossy(bytes);
        let text = text.trim_end_matches('\0');
        if !text.is_empty() {
            print!("{}", text);
        }
    }
}
