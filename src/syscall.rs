//! System calls.
//!
//! Mostly argument checking, since we don't trust user code, and calls into
//! the subsystems. Every pointer argument is validated against the current
//! supplemental page table before it is dereferenced; a bad pointer kills
//! the process with status −1. The syscall number arrives in `rax`, the
//! arguments in `rdi`, `rsi`, `rdx`, `r10`, `r8`, `r9`, and the result goes
//! back in `rax`.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use crate::error::{KernelError, Result};
use crate::file::File;
use crate::fs::Path;
use crate::kernel::Kernel;
use crate::param::{MAXPATH, NAME_MAX};
use crate::thread::TID_ERROR;

/// Saved user registers at the kernel boundary.
#[derive(Clone, Default)]
pub struct TrapFrame {
    pub rax: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub r10: u64,
    pub r8: u64,
    pub r9: u64,
    pub rsp: u64,
    pub rip: u64,
    pub eflags: u64,
}

pub const SYS_HALT: usize = 0;
pub const SYS_EXIT: usize = 1;
pub const SYS_FORK: usize = 2;
pub const SYS_EXEC: usize = 3;
pub const SYS_WAIT: usize = 4;
pub const SYS_CREATE: usize = 5;
pub const SYS_REMOVE: usize = 6;
pub const SYS_OPEN: usize = 7;
pub const SYS_FILESIZE: usize = 8;
pub const SYS_READ: usize = 9;
pub const SYS_WRITE: usize = 10;
pub const SYS_SEEK: usize = 11;
pub const SYS_TELL: usize = 12;
pub const SYS_CLOSE: usize = 13;
pub const SYS_MMAP: usize = 14;
pub const SYS_MUNMAP: usize = 15;
pub const SYS_CHDIR: usize = 16;
pub const SYS_MKDIR: usize = 17;
pub const SYS_READDIR: usize = 18;
pub const SYS_ISDIR: usize = 19;
pub const SYS_INUMBER: usize = 20;
pub const SYS_SYMLINK: usize = 21;

/// Errors from a user-memory access that mean the process handed the
/// kernel a bad pointer (or faulted it in past the swap device); fatal.
fn is_fatal(err: KernelError) -> bool {
    matches!(
        err,
        KernelError::InvalidArgument | KernelError::SwapFull | KernelError::OutOfMemory
    )
}

/// Errors from a filesystem operation that are fatal: only an outright
/// invalid argument (an empty name). Resource exhaustion such as a full
/// disk is an ordinary failure.
fn is_fatal_op(err: KernelError) -> bool {
    matches!(err, KernelError::InvalidArgument)
}

impl Kernel {
    /// The main system call interface.
    pub fn syscall(&self, tf: &mut TrapFrame) {
        // Stash the user stack pointer for kernel-mode fault resolution.
        self.with_current(|t| t.user_rsp = tf.rsp);
        let ret = match tf.rax as usize {
            SYS_HALT => {
                self.halt();
                0
            }
            SYS_EXIT => {
                self.process_exit(tf.rdi as i32);
                0
            }
            SYS_FORK => self.sys_fork(tf),
            SYS_EXEC => self.sys_exec(tf),
            SYS_WAIT => self.process_wait(tf.rdi as i32) as i64,
            SYS_CREATE => self.sys_create(tf),
            SYS_REMOVE => self.sys_remove(tf),
            SYS_OPEN => self.sys_open(tf),
            SYS_FILESIZE => self.sys_filesize(tf),
            SYS_READ => self.sys_read(tf),
            SYS_WRITE => self.sys_write(tf),
            SYS_SEEK => self.sys_seek(tf),
            SYS_TELL => self.sys_tell(tf),
            SYS_CLOSE => self.sys_close(tf),
            SYS_MMAP => self.sys_mmap(tf),
            SYS_MUNMAP => self.sys_munmap(tf),
            SYS_CHDIR => self.sys_chdir(tf),
            SYS_MKDIR => self.sys_mkdir(tf),
            SYS_READDIR => self.sys_readdir(tf),
            SYS_ISDIR => self.sys_isdir(tf),
            SYS_INUMBER => self.sys_inumber(tf),
            SYS_SYMLINK => self.sys_symlink(tf),
            _ => self.kill(),
        };
        tf.rax = ret as u64;
    }

    /// Terminates the offending process with status −1.
    fn kill(&self) -> i64 {
        self.process_exit(-1);
        -1
    }

    /// Fetches a NUL-terminated path argument from user memory.
    fn arg_str(&self, addr: u64) -> Result<Vec<u8>> {
        self.copy_in_str_user(addr as usize, MAXPATH)
    }

    /// Maps a fetch failure: bad pointers are fatal, an overlong string is
    /// an ordinary failure.
    fn fetched(&self, fetched: Result<Vec<u8>>) -> core::result::Result<Vec<u8>, i64> {
        match fetched {
            Ok(bytes) => Ok(bytes),
            Err(err) if is_fatal(err) => Err(self.kill()),
            Err(_) => Err(-1),
        }
    }

    /// Maps the result of a bool-convention operation (`create`, `remove`,
    /// `mkdir`, `chdir`, `readdir`): 1 on success, 0 on ordinary failure,
    /// death on invalid arguments.
    fn finish_bool(&self, result: Result<()>) -> i64 {
        match result {
            Ok(()) => 1,
            Err(err) if is_fatal_op(err) => self.kill(),
            Err(_) => 0,
        }
    }

    fn current_file(&self, fd: u64) -> Result<Arc<File>> {
        self.with_current(|t| t.fd_get(fd as usize))
    }

    fn current_wdir(&self) -> Option<Arc<crate::fs::Inode>> {
        self.with_current(|t| t.wdir.clone())
    }

    fn sys_fork(&self, tf: &TrapFrame) -> i64 {
        let name = match self.fetched(self.arg_str(tf.rdi)) {
            Ok(bytes) => bytes,
            Err(code) => return code,
        };
        let name = core::str::from_utf8(&name).unwrap_or("child");
        match self.process_fork(name, tf) {
            Ok(tid) => tid as i64,
            Err(_) => TID_ERROR as i64,
        }
    }

    fn sys_exec(&self, tf: &mut TrapFrame) -> i64 {
        let cmd = match self.fetched(self.arg_str(tf.rdi)) {
            Ok(bytes) => bytes,
            Err(code) => return code,
        };
        match self.process_exec(&cmd, tf) {
            Ok(()) => 0,
            // A failed exec has already torn the old image down.
            Err(_) => self.kill(),
        }
    }

    fn sys_create(&self, tf: &TrapFrame) -> i64 {
        let path = match self.fetched(self.arg_str(tf.rdi)) {
            Ok(bytes) => bytes,
            Err(code) => return code,
        };
        let wdir = self.current_wdir();
        self.finish_bool(self.fs().create(
            self,
            Path::new(&path),
            wdir.as_ref(),
            tf.rsi as u32,
        ))
    }

    fn sys_remove(&self, tf: &TrapFrame) -> i64 {
        let path = match self.fetched(self.arg_str(tf.rdi)) {
            Ok(bytes) => bytes,
            Err(code) => return code,
        };
        let wdir = self.current_wdir();
        self.finish_bool(self.fs().remove(self, Path::new(&path), wdir.as_ref()))
    }

    fn sys_open(&self, tf: &TrapFrame) -> i64 {
        let path = match self.fetched(self.arg_str(tf.rdi)) {
            Ok(bytes) => bytes,
            Err(code) => return code,
        };
        let wdir = self.current_wdir();
        let inode = match self.fs().open(self, Path::new(&path), wdir.as_ref()) {
            Ok(inode) => inode,
            Err(err) if is_fatal_op(err) => return self.kill(),
            Err(_) => return -1,
        };
        let file = File::from_inode(inode);
        match self.with_current(|t| t.fd_alloc(Arc::clone(&file))) {
            Ok(fd) => fd as i64,
            Err(_) => {
                file.close(self);
                -1
            }
        }
    }

    fn sys_filesize(&self, tf: &TrapFrame) -> i64 {
        match self.current_file(tf.rdi).and_then(|f| f.len(self)) {
            Ok(len) => len as i64,
            Err(_) => -1,
        }
    }

    fn sys_read(&self, tf: &TrapFrame) -> i64 {
        let (addr, len) = (tf.rsi as usize, tf.rdx as usize);
        // The whole destination range must be mapped writable before any
        // I/O happens.
        if let Err(err) = self.validate_user_range(addr, len, true) {
            return if is_fatal(err) { self.kill() } else { -1 };
        }
        let file = match self.current_file(tf.rdi) {
            Ok(file) => file,
            Err(_) => return -1,
        };
        let mut buf = vec![0u8; len];
        let n = match file.read(self, &mut buf) {
            Ok(n) => n,
            Err(_) => return -1,
        };
        match self.copy_out_user(addr, &buf[..n]) {
            Ok(()) => n as i64,
            Err(_) => self.kill(),
        }
    }

    fn sys_write(&self, tf: &TrapFrame) -> i64 {
        let (addr, len) = (tf.rsi as usize, tf.rdx as usize);
        // Check the whole source range before sizing the kernel buffer.
        if let Err(err) = self.validate_user_range(addr, len, false) {
            return if is_fatal(err) { self.kill() } else { -1 };
        }
        let mut buf = vec![0u8; len];
        if let Err(err) = self.copy_in_user(addr, &mut buf) {
            return if is_fatal(err) { self.kill() } else { -1 };
        }
        let file = match self.current_file(tf.rdi) {
            Ok(file) => file,
            Err(_) => return -1,
        };
        match file.write(self, &buf) {
            Ok(n) => n as i64,
            Err(_) => -1,
        }
    }

    fn sys_seek(&self, tf: &TrapFrame) -> i64 {
        match self.current_file(tf.rdi).and_then(|f| f.seek(tf.rsi as u32)) {
            Ok(()) => 0,
            Err(_) => -1,
        }
    }

    fn sys_tell(&self, tf: &TrapFrame) -> i64 {
        match self.current_file(tf.rdi).and_then(|f| f.tell()) {
            Ok(pos) => pos as i64,
            Err(_) => -1,
        }
    }

    fn sys_close(&self, tf: &TrapFrame) -> i64 {
        match self.with_current(|t| t.fd_take(tf.rdi as usize)) {
            Ok(file) => {
                file.close(self);
                0
            }
            Err(_) => -1,
        }
    }

    fn sys_mmap(&self, tf: &TrapFrame) -> i64 {
        // Every rejection is the sentinel failure value, never death.
        let file = match self.current_file(tf.r10) {
            Ok(file) => file,
            Err(_) => return 0,
        };
        if file.inode().is_none() {
            return 0;
        }
        match self.mmap(
            tf.rdi as usize,
            tf.rsi as usize,
            tf.rdx != 0,
            &file,
            tf.r8 as u32,
        ) {
            Ok(base) => base as i64,
            Err(_) => 0,
        }
    }

    fn sys_munmap(&self, tf: &TrapFrame) -> i64 {
        match self.munmap(tf.rdi as usize) {
            Ok(()) => 0,
            Err(_) => self.kill(),
        }
    }

    fn sys_chdir(&self, tf: &TrapFrame) -> i64 {
        let path = match self.fetched(self.arg_str(tf.rdi)) {
            Ok(bytes) => bytes,
            Err(code) => return code,
        };
        let wdir = self.current_wdir();
        let inode = match self.fs().open(self, Path::new(&path), wdir.as_ref()) {
            Ok(inode) => inode,
            Err(err) if is_fatal_op(err) => return self.kill(),
            Err(_) => return 0,
        };
        if !inode.is_dir() {
            self.fs().inode_close(self, &inode);
            return 0;
        }
        let old = self.with_current(|t| core::mem::replace(&mut t.wdir, Some(inode)));
        if let Some(old) = old {
            self.fs().inode_close(self, &old);
        }
        1
    }

    fn sys_mkdir(&self, tf: &TrapFrame) -> i64 {
        let path = match self.fetched(self.arg_str(tf.rdi)) {
            Ok(bytes) => bytes,
            Err(code) => return code,
        };
        let wdir = self.current_wdir();
        self.finish_bool(self.fs().mkdir(self, Path::new(&path), wdir.as_ref()))
    }

    fn sys_readdir(&self, tf: &TrapFrame) -> i64 {
        let name_addr = tf.rsi as usize;
        if let Err(err) = self.validate_user_range(name_addr, NAME_MAX + 1, true) {
            return if is_fatal(err) { self.kill() } else { 0 };
        }
        let file = match self.current_file(tf.rdi) {
            Ok(file) => file,
            Err(_) => return 0,
        };
        match file.readdir(self) {
            Ok(Some(name)) => {
                let mut out = Vec::with_capacity(name.len() + 1);
                out.extend_from_slice(&name);
                out.push(0);
                match self.copy_out_user(name_addr, &out) {
                    Ok(()) => 1,
                    Err(_) => self.kill(),
                }
            }
            Ok(None) => 0,
            Err(_) => 0,
        }
    }

    fn sys_isdir(&self, tf: &TrapFrame) -> i64 {
        match self.current_file(tf.rdi) {
            Ok(file) => file.is_dir() as i64,
            Err(_) => 0,
        }
    }

    fn sys_inumber(&self, tf: &TrapFrame) -> i64 {
        match self.current_file(tf.rdi) {
            Ok(file) => match file.inode() {
                Some(ip) => ip.inumber() as i64,
                None => -1,
            },
            Err(_) => -1,
        }
    }

    fn sys_symlink(&self, tf: &TrapFrame) -> i64 {
        let target = match self.fetched(self.arg_str(tf.rdi)) {
            Ok(bytes) => bytes,
            Err(code) => return code,
        };
        let linkpath = match self.fetched(self.arg_str(tf.rsi)) {
            Ok(bytes) => bytes,
            Err(code) => return code,
        };
        let wdir = self.current_wdir();
        match self
            .fs()
            .symlink(self, &target, Path::new(&linkpath), wdir.as_ref())
        {
            Ok(()) => 0,
            Err(err) if is_fatal_op(err) => self.kill(),
            Err(_) => -1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elf::testing::build_exec;
    use crate::kernel::testing::{test_kernel, write_file, TestKernel};
    use crate::memlayout::USER_STACK;
    use crate::param::PGSIZE;
    use crate::thread::ThreadState;

    const SEG_VADDR: u64 = 0x40_0000;

    /// A scratch area inside the initial stack page for user-side buffers.
    const UBUF: usize = USER_STACK - 2048;

    fn launch(kernel: &TestKernel) -> TrapFrame {
        let image = build_exec(SEG_VADDR, SEG_VADDR, b"codecodecode", PGSIZE as u64, false);
        write_file(kernel, "/prog", &image);
        let mut tf = TrapFrame::default();
        kernel.process_exec(b"prog", &mut tf).unwrap();
        tf
    }

    fn put_str(kernel: &TestKernel, addr: usize, s: &[u8]) {
        kernel.copy_out_user(addr, s).unwrap();
        kernel.copy_out_user(addr + s.len(), &[0]).unwrap();
    }

    fn call(kernel: &TestKernel, base: &TrapFrame, num: usize, args: &[u64]) -> i64 {
        let mut tf = base.clone();
        tf.rax = num as u64;
        let mut it = args.iter().copied();
        if let Some(v) = it.next() {
            tf.rdi = v;
        }
        if let Some(v) = it.next() {
            tf.rsi = v;
        }
        if let Some(v) = it.next() {
            tf.rdx = v;
        }
        if let Some(v) = it.next() {
            tf.r10 = v;
        }
        if let Some(v) = it.next() {
            tf.r8 = v;
        }
        kernel.syscall(&mut tf);
        tf.rax as i64
    }

    #[test]
    fn file_syscalls_round_trip() {
        let kernel = test_kernel();
        let tf = launch(&kernel);
        put_str(&kernel, UBUF, b"/data");

        assert_eq!(call(&kernel, &tf, SYS_CREATE, &[UBUF as u64, 0]), 1);
        // A second create of the same name fails without killing us.
        assert_eq!(call(&kernel, &tf, SYS_CREATE, &[UBUF as u64, 0]), 0);

        let fd = call(&kernel, &tf, SYS_OPEN, &[UBUF as u64]);
        assert!(fd >= 2, "fd = {}", fd);

        // write() pulls the payload from user memory.
        let payload = UBUF + 64;
        kernel.copy_out_user(payload, b"syscall payload").unwrap();
        assert_eq!(
            call(&kernel, &tf, SYS_WRITE, &[fd as u64, payload as u64, 15]),
            15
        );
        assert_eq!(call(&kernel, &tf, SYS_FILESIZE, &[fd as u64]), 15);
        assert_eq!(call(&kernel, &tf, SYS_TELL, &[fd as u64]), 15);
        assert_eq!(call(&kernel, &tf, SYS_SEEK, &[fd as u64, 0]), 0);

        let readback = UBUF + 128;
        assert_eq!(
            call(&kernel, &tf, SYS_READ, &[fd as u64, readback as u64, 15]),
            15
        );
        let mut got = [0u8; 15];
        kernel.copy_in_user(readback, &mut got).unwrap();
        assert_eq!(&got, b"syscall payload");

        assert_eq!(call(&kernel, &tf, SYS_ISDIR, &[fd as u64]), 0);
        assert!(call(&kernel, &tf, SYS_INUMBER, &[fd as u64]) > 0);
        assert_eq!(call(&kernel, &tf, SYS_CLOSE, &[fd as u64]), 0);
        assert_eq!(call(&kernel, &tf, SYS_CLOSE, &[fd as u64]), -1);

        put_str(&kernel, UBUF, b"/data");
        assert_eq!(call(&kernel, &tf, SYS_REMOVE, &[UBUF as u64]), 1);
        assert_eq!(call(&kernel, &tf, SYS_OPEN, &[UBUF as u64]), -1);
    }

    #[test]
    fn console_write_goes_to_the_console() {
        let kernel = test_kernel();
        let tf = launch(&kernel);
        kernel.copy_out_user(UBUF, b"hello, console").unwrap();
        assert_eq!(call(&kernel, &tf, SYS_WRITE, &[1, UBUF as u64, 14]), 14);
        assert_eq!(kernel.console.take_output(), b"hello, console");
    }

    #[test]
    fn console_read_consumes_scripted_input() {
        let kernel = test_kernel();
        let tf = launch(&kernel);
        kernel.console.feed(b"typed");
        assert_eq!(call(&kernel, &tf, SYS_READ, &[0, UBUF as u64, 5]), 5);
        let mut got = [0u8; 5];
        kernel.copy_in_user(UBUF, &mut got).unwrap();
        assert_eq!(&got, b"typed");
    }

    #[test]
    fn bad_pointers_kill_the_process() {
        let kernel = test_kernel();
        let tf = launch(&kernel);
        let me = kernel.current_tid();
        // An unmapped buffer for create's path is fatal: the thread dies
        // and, having no parent, vanishes.
        let _ = call(&kernel, &tf, SYS_CREATE, &[0x7000_0000, 0]);
        let sched = kernel.sched().lock();
        assert_ne!(sched.current, me);
        assert!(sched.threads.get(&me).is_none());
    }

    #[test]
    fn write_from_unmapped_buffer_kills() {
        let kernel = test_kernel();
        let tf = launch(&kernel);
        let me = kernel.current_tid();
        let _ = call(&kernel, &tf, SYS_WRITE, &[1, 0x7000_0000, 4]);
        assert_ne!(kernel.current_tid(), me);
    }

    #[test]
    fn read_into_readonly_buffer_fails() {
        let kernel = test_kernel();
        let tf = launch(&kernel);
        // The code segment is mapped read-only.
        let me = kernel.current_tid();
        let _ = call(&kernel, &tf, SYS_READ, &[0, SEG_VADDR, 4]);
        assert_ne!(kernel.current_tid(), me);
    }

    #[test]
    fn exit_prints_the_termination_line() {
        let kernel = test_kernel();
        let tf = launch(&kernel);
        let _ = kernel.console.take_output();
        let _ = call(&kernel, &tf, SYS_EXIT, &[3]);
        assert_eq!(kernel.console.take_output(), b"prog: exit(3)\n");
    }

    #[test]
    fn directory_syscalls() {
        let kernel = test_kernel();
        let tf = launch(&kernel);

        put_str(&kernel, UBUF, b"/a");
        assert_eq!(call(&kernel, &tf, SYS_MKDIR, &[UBUF as u64]), 1);
        put_str(&kernel, UBUF, b"/a/b");
        assert_eq!(call(&kernel, &tf, SYS_MKDIR, &[UBUF as u64]), 1);

        // chdir into /a, then a relative mkdir.
        put_str(&kernel, UBUF, b"/a");
        assert_eq!(call(&kernel, &tf, SYS_CHDIR, &[UBUF as u64]), 1);
        put_str(&kernel, UBUF, b"b/c");
        assert_eq!(call(&kernel, &tf, SYS_MKDIR, &[UBUF as u64]), 1);
        // Creating it again collides.
        assert_eq!(call(&kernel, &tf, SYS_MKDIR, &[UBUF as u64]), 0);

        // readdir of /a yields exactly "b".
        put_str(&kernel, UBUF, b"/a");
        let fd = call(&kernel, &tf, SYS_OPEN, &[UBUF as u64]);
        assert!(fd >= 2);
        assert_eq!(call(&kernel, &tf, SYS_ISDIR, &[fd as u64]), 1);
        let name_buf = UBUF + 256;
        assert_eq!(
            call(&kernel, &tf, SYS_READDIR, &[fd as u64, name_buf as u64]),
            1
        );
        let mut name = [0u8; 2];
        kernel.copy_in_user(name_buf, &mut name).unwrap();
        assert_eq!(&name, b"b\0");
        assert_eq!(
            call(&kernel, &tf, SYS_READDIR, &[fd as u64, name_buf as u64]),
            0
        );
        assert_eq!(call(&kernel, &tf, SYS_CLOSE, &[fd as u64]), 0);
    }

    #[test]
    fn symlink_syscall_follows_through_open() {
        let kernel = test_kernel();
        let tf = launch(&kernel);

        put_str(&kernel, UBUF, b"/t");
        assert_eq!(call(&kernel, &tf, SYS_CREATE, &[UBUF as u64, 3]), 1);
        let fd = call(&kernel, &tf, SYS_OPEN, &[UBUF as u64]);
        kernel.copy_out_user(UBUF + 64, b"abc").unwrap();
        assert_eq!(
            call(&kernel, &tf, SYS_WRITE, &[fd as u64, (UBUF + 64) as u64, 3]),
            3
        );
        assert_eq!(call(&kernel, &tf, SYS_CLOSE, &[fd as u64]), 0);

        put_str(&kernel, UBUF, b"/t");
        put_str(&kernel, UBUF + 32, b"/s");
        assert_eq!(
            call(&kernel, &tf, SYS_SYMLINK, &[UBUF as u64, (UBUF + 32) as u64]),
            0
        );
        let fd = call(&kernel, &tf, SYS_OPEN, &[(UBUF + 32) as u64]);
        assert!(fd >= 2);
        let readback = UBUF + 128;
        assert_eq!(
            call(&kernel, &tf, SYS_READ, &[fd as u64, readback as u64, 3]),
            3
        );
        let mut got = [0u8; 3];
        kernel.copy_in_user(readback, &mut got).unwrap();
        assert_eq!(&got, b"abc");
        let _ = call(&kernel, &tf, SYS_CLOSE, &[fd as u64]);

        // A link to the link resolves the same.
        put_str(&kernel, UBUF, b"/s");
        put_str(&kernel, UBUF + 32, b"/s2");
        assert_eq!(
            call(&kernel, &tf, SYS_SYMLINK, &[UBUF as u64, (UBUF + 32) as u64]),
            0
        );
        let fd = call(&kernel, &tf, SYS_OPEN, &[(UBUF + 32) as u64]);
        assert!(fd >= 2);
        assert_eq!(
            call(&kernel, &tf, SYS_READ, &[fd as u64, readback as u64, 3]),
            3
        );
        kernel.copy_in_user(readback, &mut got).unwrap();
        assert_eq!(&got, b"abc");
    }

    #[test]
    fn mmap_syscall_round_trip() {
        let kernel = test_kernel();
        let tf = launch(&kernel);

        put_str(&kernel, UBUF, b"/m");
        assert_eq!(
            call(&kernel, &tf, SYS_CREATE, &[UBUF as u64, PGSIZE as u64]),
            1
        );
        let fd = call(&kernel, &tf, SYS_OPEN, &[UBUF as u64]);
        assert!(fd >= 2);

        let map_base = 0x1000_0000u64;
        assert_eq!(
            call(
                &kernel,
                &tf,
                SYS_MMAP,
                &[map_base, PGSIZE as u64, 1, fd as u64, 0]
            ),
            map_base as i64
        );
        // Console fds never map.
        assert_eq!(
            call(&kernel, &tf, SYS_MMAP, &[0x2000_0000, 64, 1, 1, 0]),
            0
        );

        kernel.copy_out_user(map_base as usize, b"through the map").unwrap();
        assert_eq!(call(&kernel, &tf, SYS_MUNMAP, &[map_base]), 0);

        // The write-back is visible through read().
        assert_eq!(call(&kernel, &tf, SYS_SEEK, &[fd as u64, 0]), 0);
        let readback = UBUF + 128;
        assert_eq!(
            call(&kernel, &tf, SYS_READ, &[fd as u64, readback as u64, 15]),
            15
        );
        let mut got = [0u8; 15];
        kernel.copy_in_user(readback, &mut got).unwrap();
        assert_eq!(&got, b"through the map");
    }

    #[test]
    fn fork_and_wait_through_the_gate() {
        let kernel = test_kernel();
        let tf = launch(&kernel);
        put_str(&kernel, UBUF, b"kid");
        let child = call(&kernel, &tf, SYS_FORK, &[UBUF as u64]);
        assert!(child > 0);
        {
            let sched = kernel.sched().lock();
            let ct = &sched.threads[&(child as i32)];
            assert_eq!(ct.tf.rax, 0);
            assert_eq!(ct.state, ThreadState::Ready);
        }
        // Run the child; it exits with status 5.
        kernel.thread_yield();
        assert_eq!(kernel.current_tid(), child as i32);
        let _ = call(&kernel, &tf, SYS_EXIT, &[5]);
        assert_eq!(call(&kernel, &tf, SYS_WAIT, &[child as u64]), 5);
        assert_eq!(call(&kernel, &tf, SYS_WAIT, &[child as u64]), -1);
    }

    #[test]
    fn halt_flushes_and_stops() {
        let kernel = test_kernel();
        let tf = launch(&kernel);
        assert!(!kernel.halted());
        let _ = call(&kernel, &tf, SYS_HALT, &[]);
        assert!(kernel.halted());
    }

    #[test]
    fn unknown_syscall_number_kills() {
        let kernel = test_kernel();
        let tf = launch(&kernel);
        let me = kernel.current_tid();
        let _ = call(&kernel, &tf, 999, &[]);
        assert_ne!(kernel.current_tid(), me);
    }
}
