//! User processes: exec, fork, wait, exit.
//!
//! `exec` replaces the current address space with a lazily loaded ELF
//! image and the conventional argv stack; `fork` clones the whole process
//! (address space, descriptor table, working directory) with the child
//! returning 0; `wait` reaps a dead child's status; `exit` tears the
//! process down and parks the thread until its parent has observed it.

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;

use array_macro::array;

use crate::elf::{
    ElfHdr, ProgHdr, ElfProgFlags, ELF_HDR_SIZE, ELF_PROG_DYNAMIC, ELF_PROG_INTERP,
    ELF_PROG_LOAD, ELF_PROG_SHLIB, PROG_HDR_SIZE,
};
use crate::error::{KernelError, Result};
use crate::file::File;
use crate::fs::{Inode, Path};
use crate::kernel::Kernel;
use crate::memlayout::{is_user_vaddr, pg_round_up, USER_STACK};
use crate::param::{MAXARG, NOFILE, PGSIZE, PRI_DEFAULT};
use crate::syscall::TrapFrame;
use crate::thread::{truncate_name, FdTable, ThreadState, Tid};
use crate::vm::{AsId, PageInit, PageKind, SegmentAux};

/// Checks whether a program header describes a loadable segment.
fn segment_valid(ph: &ProgHdr, file_len: u32) -> bool {
    let pgmask = PGSIZE as u64 - 1;
    // Offset and vaddr must agree on the page offset, the segment must sit
    // inside the file and inside user space, and page 0 stays unmapped.
    ph.off & pgmask == ph.vaddr & pgmask
        && ph.off <= file_len as u64
        && ph.memsz >= ph.filesz
        && ph.memsz > 0
        && is_user_vaddr(ph.vaddr as usize)
        && is_user_vaddr(ph.vaddr.wrapping_add(ph.memsz) as usize)
        && ph.vaddr.checked_add(ph.memsz).is_some()
        && ph.vaddr >= PGSIZE as u64
}

impl Kernel {
    /// Replaces the current process image with the program named by
    /// `cmdline` (whitespace-separated arguments). On success the trap
    /// frame is rewritten to enter the new image; on failure the old image
    /// is already gone and the caller must exit.
    pub fn process_exec(&self, cmdline: &[u8], tf: &mut TrapFrame) -> Result<()> {
        let args: Vec<Vec<u8>> = cmdline
            .split(|&b| b == b' ')
            .filter(|part| !part.is_empty())
            .take(MAXARG)
            .map(|part| part.to_vec())
            .collect();
        if args.is_empty() {
            return Err(KernelError::InvalidArgument);
        }

        // Kill the current image first; exec cannot be undone.
        let (old_as, old_exec, wdir) = self.with_current(|t| {
            (t.as_id.take(), t.exec_file.take(), t.wdir.clone())
        });
        if let Some(as_id) = old_as {
            self.vm_destroy_space(as_id);
        }
        if let Some(file) = old_exec {
            file.close(self);
        }

        let as_id = self.vm_new_space();
        self.with_current(|t| t.as_id = Some(as_id));
        let loaded = self.load(as_id, &args, wdir.as_ref(), tf);
        if loaded.is_err() {
            self.vm_destroy_space(as_id);
            self.with_current(|t| t.as_id = None);
        }
        loaded
    }

    /// Loads the executable and prepares the initial user stack.
    fn load(
        &self,
        as_id: AsId,
        args: &[Vec<u8>],
        wdir: Option<&Arc<Inode>>,
        tf: &mut TrapFrame,
    ) -> Result<()> {
        let inode = self.fs().open(self, Path::new(&args[0]), wdir)?;
        if inode.is_dir() {
            self.fs().inode_close(self, &inode);
            return Err(KernelError::IsDirectory);
        }
        let file = File::from_inode(inode);
        file.deny_write();

        let result = self.load_image(as_id, &file, tf).and_then(|_| {
            self.setup_stack(as_id, tf)?;
            self.pass_arguments(args, tf)
        });
        match result {
            Ok(()) => {
                let name = truncate_name(core::str::from_utf8(&args[0]).unwrap_or("user"));
                self.with_current(|t| {
                    t.exec_file = Some(file);
                    t.name = name;
                });
                log::debug!("exec: image loaded into space {}", as_id);
                Ok(())
            }
            Err(err) => {
                file.close(self);
                Err(err)
            }
        }
    }

    /// Installs every PT_LOAD segment as pending zero/file pages.
    fn load_image(&self, as_id: AsId, file: &Arc<File>, tf: &mut TrapFrame) -> Result<()> {
        let mut hdr_buf = [0u8; ELF_HDR_SIZE];
        if file.read_at(self, &mut hdr_buf, 0)? != ELF_HDR_SIZE {
            return Err(KernelError::InvalidArgument);
        }
        let ehdr = ElfHdr::parse(&hdr_buf);
        if !ehdr.is_valid() {
            return Err(KernelError::InvalidArgument);
        }
        let file_len = file.len(self)?;

        let mut file_ofs = ehdr.phoff;
        for _ in 0..ehdr.phnum {
            if file_ofs > file_len as u64 {
                return Err(KernelError::InvalidArgument);
            }
            let mut ph_buf = [0u8; PROG_HDR_SIZE];
            if file.read_at(self, &mut ph_buf, file_ofs as u32)? != PROG_HDR_SIZE {
                return Err(KernelError::InvalidArgument);
            }
            file_ofs += PROG_HDR_SIZE as u64;
            let ph = ProgHdr::parse(&ph_buf);
            match ph.typ {
                ELF_PROG_LOAD => {
                    if !segment_valid(&ph, file_len) {
                        return Err(KernelError::InvalidArgument);
                    }
                    self.load_segment(as_id, file, &ph)?;
                }
                ELF_PROG_DYNAMIC | ELF_PROG_INTERP | ELF_PROG_SHLIB => {
                    return Err(KernelError::InvalidArgument);
                }
                _ => {}
            }
        }
        tf.rip = ehdr.entry;
        Ok(())
    }

    fn load_segment(&self, as_id: AsId, file: &Arc<File>, ph: &ProgHdr) -> Result<()> {
        let pgmask = PGSIZE as u64 - 1;
        let writable = ElfProgFlags::from_bits_truncate(ph.flags).contains(ElfProgFlags::WRITE);
        let mut upage = (ph.vaddr & !pgmask) as usize;
        let mut offset = (ph.off & !pgmask) as u32;
        let page_offset = (ph.vaddr & pgmask) as usize;
        let (mut read_bytes, mut zero_bytes) = if ph.filesz > 0 {
            let read = page_offset + ph.filesz as usize;
            (read, pg_round_up(page_offset + ph.memsz as usize) - read)
        } else {
            (0, pg_round_up(page_offset + ph.memsz as usize))
        };

        while read_bytes > 0 || zero_bytes > 0 {
            let page_read_bytes = read_bytes.min(PGSIZE);
            let page_zero_bytes = PGSIZE - page_read_bytes;
            self.vm_alloc_page(
                as_id,
                upage,
                writable,
                PageInit::LoadSegment(SegmentAux {
                    file: Arc::clone(file),
                    offset,
                    read_bytes: page_read_bytes,
                    zero_bytes: page_zero_bytes,
                }),
                PageKind::Anon,
            )?;
            read_bytes -= page_read_bytes;
            zero_bytes -= page_zero_bytes;
            upage += PGSIZE;
            offset += page_read_bytes as u32;
        }
        Ok(())
    }

    /// Claims one zeroed page just below `USER_STACK`; further stack pages
    /// arrive through the fault handler's growth heuristic.
    fn setup_stack(&self, as_id: AsId, tf: &mut TrapFrame) -> Result<()> {
        let stack_bottom = USER_STACK - PGSIZE;
        self.vm_alloc_page(as_id, stack_bottom, true, PageInit::Zero, PageKind::Anon)?;
        self.vm_claim_page(as_id, stack_bottom)?;
        {
            let mut vm = self.vm().lock();
            if let Some(space) = vm.space_mut(as_id) {
                space.stack_ceiling = stack_bottom;
            }
        }
        tf.rsp = USER_STACK as u64;
        Ok(())
    }

    /// Builds the conventional argv image on the user stack: the argument
    /// strings, 8-byte alignment padding, a NULL sentinel, the argv array
    /// and a fake return address. Leaves `rdi = argc`, `rsi = &argv[0]`.
    fn pass_arguments(&self, args: &[Vec<u8>], tf: &mut TrapFrame) -> Result<()> {
        let mut rsp = tf.rsp as usize;
        let mut arg_addrs = Vec::with_capacity(args.len());
        for arg in args.iter().rev() {
            rsp -= arg.len() + 1;
            self.copy_out_user(rsp, arg)?;
            self.copy_out_user(rsp + arg.len(), &[0])?;
            arg_addrs.push(rsp as u64);
        }
        arg_addrs.reverse();

        let pad = rsp % 8;
        if pad > 0 {
            rsp -= pad;
            self.copy_out_user(rsp, &[0u8; 8][..pad])?;
        }
        rsp -= 8;
        self.copy_out_obj(rsp, &0u64)?;
        for addr in arg_addrs.iter().rev() {
            rsp -= 8;
            self.copy_out_obj(rsp, addr)?;
        }
        let argv_base = rsp as u64;
        rsp -= 8;
        self.copy_out_obj(rsp, &0u64)?;

        tf.rsp = rsp as u64;
        tf.rdi = args.len() as u64;
        tf.rsi = argv_base;
        Ok(())
    }

    /// Clones the current process. The child starts from a snapshot of the
    /// parent's trap frame with `rax = 0` and owns deep copies of the
    /// address space, descriptor table and working directory.
    pub fn process_fork(&self, name: &str, parent_tf: &TrapFrame) -> Result<Tid> {
        let (parent, fds, wdir, as_id) = {
            let mut sched = self.sched().lock();
            let parent = sched.current;
            let t = sched.thread_mut(parent);
            (parent, t.fds.clone(), t.wdir.clone(), t.as_id)
        };

        // Duplicate the open files: fresh handles, same inodes, positions
        // copied.
        let mut child_fds: Box<FdTable> = Box::new(array![_ => None; NOFILE]);
        let mut duped: Vec<Arc<File>> = Vec::new();
        let mut dup_failed = None;
        for (fd, slot) in fds.iter().enumerate() {
            if let Some(file) = slot {
                match file.duplicate(self) {
                    Ok(dup) => {
                        duped.push(Arc::clone(&dup));
                        child_fds[fd] = Some(dup);
                    }
                    Err(err) => {
                        dup_failed = Some(err);
                        break;
                    }
                }
            }
        }
        let child_wdir = wdir.as_ref().map(|dir| self.fs().inode_reopen(dir));
        let child_as = if dup_failed.is_none() {
            match as_id {
                Some(src) => match self.vm_copy_space(src) {
                    Ok(dst) => Some(dst),
                    Err(err) => {
                        dup_failed = Some(err);
                        None
                    }
                },
                None => None,
            }
        } else {
            None
        };

        if let Some(err) = dup_failed {
            for file in duped {
                file.close(self);
            }
            if let Some(dir) = child_wdir {
                self.fs().inode_close(self, &dir);
            }
            return Err(err);
        }

        let child = {
            let mut sched = self.sched().lock();
            let child = sched.spawn(name, PRI_DEFAULT);
            {
                let t = sched.thread_mut(child);
                t.parent = Some(parent);
                t.fds = child_fds;
                t.wdir = child_wdir;
                t.as_id = child_as;
                t.tf = parent_tf.clone();
                t.tf.rax = 0;
            }
            sched.thread_mut(parent).children.push(child);
            sched.unblock(child);
            child
        };
        log::debug!("fork: child {} of {}", child, parent);
        Ok(child)
    }

    /// Waits for child `pid` to die and returns its exit status, reaping
    /// the thread. Returns −1 for anything that is not an unreaped child of
    /// the caller.
    pub fn process_wait(&self, pid: Tid) -> i32 {
        let wait_sema = {
            let sched = self.sched().lock();
            let cur = sched.current;
            match sched.threads.get(&pid) {
                Some(child) if child.parent == Some(cur) => Arc::clone(&child.wait_sema),
                _ => return -1,
            }
        };
        wait_sema.down(self);

        let mut sched = self.sched().lock();
        let status = match sched.threads.get(&pid) {
            Some(child) => {
                assert_eq!(child.state, ThreadState::Dying);
                child.exit_status
            }
            None => -1,
        };
        let _ = sched.threads.remove(&pid);
        let cur = sched.current;
        sched.thread_mut(cur).children.retain(|&c| c != pid);
        status
    }

    /// Terminates the current process: prints the exit line, releases every
    /// resource, signals the parent and schedules away.
    pub fn process_exit(&self, status: i32) {
        let (name, fds, wdir, as_id, exec_file, wait_sema, parent, children) = {
            let mut sched = self.sched().lock();
            let cur = sched.current;
            let t = sched.thread_mut(cur);
            t.exit_status = status;
            (
                t.name.clone(),
                core::mem::replace(&mut t.fds, Box::new(array![_ => None; NOFILE])),
                t.wdir.take(),
                t.as_id.take(),
                t.exec_file.take(),
                Arc::clone(&t.wait_sema),
                t.parent,
                core::mem::take(&mut t.children),
            )
        };

        let msg = alloc::format!("{}: exit({})\n", name.as_str(), status);
        self.hal().console().putbuf(msg.as_bytes());
        log::info!("process {} exits with {}", name.as_str(), status);

        for slot in fds.iter() {
            if let Some(file) = slot {
                file.close(self);
            }
        }
        // The address space goes before the executable: tearing down the
        // segments may still read the image's pages.
        if let Some(id) = as_id {
            self.vm_destroy_space(id);
        }
        if let Some(file) = exec_file {
            file.close(self);
        }
        if let Some(dir) = wdir {
            self.fs().inode_close(self, &dir);
        }

        {
            let mut sched = self.sched().lock();
            // Children lose their parent; dead ones have no reaper left.
            for child in children {
                let reap = match sched.threads.get_mut(&child) {
                    Some(t) => {
                        t.parent = None;
                        t.state == ThreadState::Dying
                    }
                    None => false,
                };
                if reap {
                    let _ = sched.threads.remove(&child);
                }
            }
            let cur = sched.current;
            sched.thread_mut(cur).state = ThreadState::Dying;
        }
        if parent.is_some() {
            wait_sema.up(self);
        }
        self.sched().lock().exit_current();
    }
}
