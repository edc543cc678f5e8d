//! Cooperative scheduler.
//!
//! Tasks are cooperative: the only suspension points are [`sleep_ms`] and
//! task completion. Every task owns a fixed-size kernel stack; switching
//! is a small assembly primitive that saves the callee-saved registers and
//! swaps stack pointers. Sleeping tasks sit in a list ordered by wake time
//! ascending, so the head is always the next task to become ready; equal
//! wake times run in insertion order.
//!
//! The flow that calls [`init`] becomes the *main task* (id 0). It must
//! never complete — it is the fallback that runs when nothing else is
//! ready.

use core::ptr;

use crate::config::TASK_STACK_SIZE;

#[cfg(target_os = "none")]
use core::mem::MaybeUninit;
#[cfg(target_os = "none")]
use core::ptr::NonNull;
#[cfg(target_os = "none")]
use tachyon_core::error::{Errno, KResult};
#[cfg(target_os = "none")]
use tachyon_core::sync::SpinLock;

#[cfg(target_os = "none")]
use crate::mm::kvalloc;
#[cfg(target_os = "none")]
use crate::time;

/// Task body: invoked once with the context passed to [`create_task`].
pub type TaskFn = fn(*mut ());

#[repr(C)]
struct Task {
    /// Saved stack pointer while the task is switched out.
    saved_sp: *mut u64,
    /// Absolute time at which the task becomes ready again.
    wake_ms: u64,
    id: u16,
    callback: Option<TaskFn>,
    ctx: *mut (),
    /// Sleep-list links; null while not enqueued.
    prev: *mut Task,
    next: *mut Task,
    stack: [u8; TASK_STACK_SIZE],
}

struct SchedState {
    initialized: bool,
    /// The task currently executing. There is exactly one.
    current: *mut Task,
    /// Head of the sleep list (earliest wake time).
    head: *mut Task,
    main: *mut Task,
    next_id: u16,
}

// SAFETY: All task pointers are only dereferenced under the lock or by the
// single flow that owns the CPU.
unsafe impl Send for SchedState {}

#[cfg(target_os = "none")]
static SCHED: SpinLock<SchedState> = SpinLock::new(SchedState {
    initialized: false,
    current: ptr::null_mut(),
    head: ptr::null_mut(),
    main: ptr::null_mut(),
    next_id: 0,
});

/// Backing storage for the main task. Its stack field is unused — the main
/// task keeps running on the boot stack.
#[cfg(target_os = "none")]
static mut MAIN_TASK: MaybeUninit<Task> = MaybeUninit::uninit();

// ---------------------------------------------------------------------------
// Stack switch primitive
// ---------------------------------------------------------------------------

#[cfg(target_os = "none")]
core::arch::global_asm!(
    // fn(old_sp_slot: *mut *mut u64 [rdi], new_sp: *mut u64 [rsi])
    ".global __sched_context_switch",
    "__sched_context_switch:",
    "    push rbp",
    "    push rbx",
    "    push r12",
    "    push r13",
    "    push r14",
    "    push r15",
    "    mov [rdi], rsp",
    "    mov rsp, rsi",
    "    pop r15",
    "    pop r14",
    "    pop r13",
    "    pop r12",
    "    pop rbx",
    "    pop rbp",
    "    ret",
    // fn(new_sp: *mut u64 [rdi]) -> ! — no state is saved; the old stack
    // is gone.
    ".global __sched_context_switch_final",
    "__sched_context_switch_final:",
    "    mov rsp, rdi",
    "    pop r15",
    "    pop r14",
    "    pop r13",
    "    pop r12",
    "    pop rbx",
    "    pop rbp",
    "    ret",
);

#[cfg(target_os = "none")]
unsafe extern "C" {
    fn __sched_context_switch(old_sp_slot: *mut *mut u64, new_sp: *mut u64);
    fn __sched_context_switch_final(new_sp: *mut u64) -> !;
}

// ---------------------------------------------------------------------------
// Sleep list
// ---------------------------------------------------------------------------

/// Inserts `task` so the list stays ordered by wake time ascending; a task
/// with a wake time equal to existing entries goes after them.
fn insert_sleeping(s: &mut SchedState, task: *mut Task) {
    // SAFETY: All nodes are live tasks owned by the scheduler.
    unsafe {
        let wake = (*task).wake_ms;
        let mut prev: *mut Task = ptr::null_mut();
        let mut cur = s.head;
        while !cur.is_null() && (*cur).wake_ms <= wake {
            prev = cur;
            cur = (*cur).next;
        }

        (*task).prev = prev;
        (*task).next = cur;
        if prev.is_null() {
            s.head = task;
        } else {
            (*prev).next = task;
        }
        if !cur.is_null() {
            (*cur).prev = task;
        }
    }
}

/// Unlinks `task` from the sleep list.
fn remove_sleeping(s: &mut SchedState, task: *mut Task) {
    // SAFETY: As for insert_sleeping; `task` is currently enqueued.
    unsafe {
        let (prev, next) = ((*task).prev, (*task).next);
        if prev.is_null() {
            debug_assert!(s.head == task);
            s.head = next;
        } else {
            (*prev).next = next;
        }
        if !next.is_null() {
            (*next).prev = prev;
        }
        (*task).prev = ptr::null_mut();
        (*task).next = ptr::null_mut();
    }
}

// ---------------------------------------------------------------------------
// Public interface
// ---------------------------------------------------------------------------

/// Initialises the scheduler; the calling flow becomes the main task.
#[cfg(target_os = "none")]
pub fn init() {
    let mut s = SCHED.lock();
    assert!(!s.initialized, "scheduler already initialized");

    // SAFETY: Single initialisation; the write happens before any other
    // code can reach the task through the state below.
    let main = unsafe {
        let main = core::ptr::addr_of_mut!(MAIN_TASK) as *mut Task;
        ptr::addr_of_mut!((*main).saved_sp).write(ptr::null_mut());
        ptr::addr_of_mut!((*main).wake_ms).write(0);
        ptr::addr_of_mut!((*main).id).write(0);
        ptr::addr_of_mut!((*main).callback).write(None);
        ptr::addr_of_mut!((*main).ctx).write(ptr::null_mut());
        ptr::addr_of_mut!((*main).prev).write(ptr::null_mut());
        ptr::addr_of_mut!((*main).next).write(ptr::null_mut());
        main
    };

    s.next_id = 1;
    s.current = main;
    s.main = main;
    s.initialized = true;
    crate::kinfo!("sched: initialized, main task id 0");
}

/// Id of the running task; 0 before [`init`] (consistent with the main
/// task's id).
#[cfg(target_os = "none")]
pub fn current_id() -> u16 {
    let s = SCHED.lock();
    if !s.initialized {
        return 0;
    }
    // SAFETY: `current` is a live task.
    unsafe { (*s.current).id }
}

/// Creates a task that will run `callback(ctx)` and then disappear. The
/// task becomes ready immediately and first runs the next time the current
/// flow sleeps.
#[cfg(target_os = "none")]
pub fn create_task(callback: TaskFn, ctx: *mut ()) -> KResult<()> {
    let mem = kvalloc::alloc(core::mem::size_of::<Task>(), core::mem::align_of::<Task>())
        .ok_or(Errno::Enomem)?;
    let task = mem.as_ptr() as *mut Task;

    // SAFETY: `task` points at a fresh kvalloc block big enough for Task;
    // every field is written before the task becomes reachable.
    unsafe {
        ptr::addr_of_mut!((*task).callback).write(Some(callback));
        ptr::addr_of_mut!((*task).ctx).write(ctx);
        ptr::addr_of_mut!((*task).prev).write(ptr::null_mut());
        ptr::addr_of_mut!((*task).next).write(ptr::null_mut());
        ptr::addr_of_mut!((*task).wake_ms).write(0);

        // Build the initial stack frame so the first switch-in pops six
        // callee-saved registers and returns into `task_entry`. The entry
        // slot sits at a 16-byte boundary, which leaves rsp ≡ 8 (mod 16)
        // at function entry as the ABI expects.
        let stack_base = ptr::addr_of_mut!((*task).stack) as *mut u8;
        let top = (stack_base as usize + TASK_STACK_SIZE) & !15;
        let entry_slot = (top - 16) as *mut u64;
        entry_slot.write(task_entry as usize as u64);
        let mut sp = entry_slot;
        for _ in 0..6 {
            sp = sp.sub(1);
            sp.write(0); // rbp, rbx, r12..r15
        }
        ptr::addr_of_mut!((*task).saved_sp).write(sp);
    }

    let mut s = SCHED.lock();
    assert!(s.initialized, "scheduler not initialized");
    // SAFETY: As above; id assignment happens under the lock.
    unsafe {
        ptr::addr_of_mut!((*task).id).write(s.next_id);
    }
    s.next_id += 1;
    insert_sleeping(&mut s, task);
    Ok(())
}

/// First frame of every task: runs the callback, then finishes the task.
#[cfg(target_os = "none")]
extern "C" fn task_entry() -> ! {
    let (callback, ctx) = {
        let s = SCHED.lock();
        // SAFETY: `current` is the task that was just switched in.
        unsafe { ((*s.current).callback.expect("task without callback"), (*s.current).ctx) }
    };
    callback(ctx);
    task_finish();
}

/// Tears down the finished task and switches to the next ready one. The
/// switch is one-way; this function never returns.
#[cfg(target_os = "none")]
fn task_finish() -> ! {
    loop {
        let now = time::current_ms();
        let mut s = SCHED.lock();
        let head = s.head;
        assert!(!head.is_null(), "last task finished with nothing to run");
        // SAFETY: Sleep-list nodes are live tasks.
        if unsafe { (*head).wake_ms } > now {
            drop(s);
            core::hint::spin_loop();
            continue;
        }

        let next = head;
        let dead = s.current;
        assert!(dead != s.main, "main task must not finish");
        assert!(next != dead);
        remove_sleeping(&mut s, next);
        s.current = next;
        // SAFETY: `next` is switched out, so its saved_sp is valid.
        let new_sp = unsafe { (*next).saved_sp };
        drop(s);

        // Release the dead task's memory before the final switch. The
        // allocator only writes bookkeeping at the block's base, far below
        // the live stack frames at the top.
        // SAFETY: `dead` came from kvalloc in create_task and no pointer to
        // it survives this function.
        unsafe {
            kvalloc::free(
                NonNull::new_unchecked(dead as *mut u8),
                core::mem::size_of::<Task>(),
            );
        }
        // SAFETY: One-way switch onto a valid saved stack.
        unsafe { __sched_context_switch_final(new_sp) };
    }
}

/// Suspends the calling task for at least `ms` milliseconds. Other ready
/// tasks run in the meantime; if none is ready the CPU spins until the
/// earliest sleeper is due.
#[cfg(target_os = "none")]
pub fn sleep_ms(ms: u64) {
    let start = time::current_ms();
    let me;
    {
        let mut s = SCHED.lock();
        assert!(s.initialized, "scheduler not initialized");
        me = s.current;
        // SAFETY: `me` is the live current task.
        unsafe { (*me).wake_ms = start + ms };
        insert_sleeping(&mut s, me);
    }

    loop {
        let now = time::current_ms();
        let mut s = SCHED.lock();
        let head = s.head;
        debug_assert!(!head.is_null());
        // SAFETY: Sleep-list nodes are live tasks.
        if unsafe { (*head).wake_ms } > now {
            drop(s);
            core::hint::spin_loop();
            continue;
        }

        let next = head;
        remove_sleeping(&mut s, next);
        if next == me {
            // Nobody else became ready first; just keep running.
            break;
        }

        let old = s.current;
        s.current = next;
        // SAFETY: `old` is alive (it is me, parked in the sleep list);
        // `next` is switched out with a valid saved_sp.
        let old_sp_slot = unsafe { ptr::addr_of_mut!((*old).saved_sp) };
        let new_sp = unsafe { (*next).saved_sp };
        drop(s);
        // SAFETY: Both stacks belong to live tasks; whoever resumes us has
        // already removed us from the sleep list.
        unsafe { __sched_context_switch(old_sp_slot, new_sp) };
        break;
    }

    // The contract callers rely on.
    assert!(time::current_ms() - start >= ms);
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A parked task for list tests; the body never runs.
    fn parked(id: u16, wake_ms: u64) -> Task {
        Task {
            saved_sp: ptr::null_mut(),
            wake_ms,
            id,
            callback: None,
            ctx: ptr::null_mut(),
            prev: ptr::null_mut(),
            next: ptr::null_mut(),
            stack: [0; TASK_STACK_SIZE],
        }
    }

    fn empty_state() -> SchedState {
        SchedState {
            initialized: false,
            current: ptr::null_mut(),
            head: ptr::null_mut(),
            main: ptr::null_mut(),
            next_id: 0,
        }
    }

    /// Ids of the sleep list, head to tail, validating every back link on
    /// the way.
    fn list_ids(s: &SchedState) -> Vec<u16> {
        let mut out = Vec::new();
        let mut prev: *mut Task = ptr::null_mut();
        let mut cur = s.head;
        while !cur.is_null() {
            // SAFETY: Test tasks are live stack locals for the whole test.
            unsafe {
                assert_eq!((*cur).prev, prev, "broken back link");
                out.push((*cur).id);
                prev = cur;
                cur = (*cur).next;
            }
        }
        out
    }

    #[test]
    fn parked_task_is_inert() {
        let t = parked(1, 0);
        assert!(t.saved_sp.is_null());
        assert!(t.callback.is_none());
        assert!(t.ctx.is_null());
        assert_eq!(t.stack.len(), TASK_STACK_SIZE);
    }

    #[test]
    fn fresh_state_has_no_tasks() {
        let s = empty_state();
        assert!(!s.initialized);
        assert!(s.current.is_null());
        assert!(s.main.is_null());
        assert_eq!(s.next_id, 0);
        assert!(list_ids(&s).is_empty());
    }

    #[test]
    fn insert_orders_by_wake_time() {
        let mut s = empty_state();
        let mut a = parked(1, 30);
        let mut b = parked(2, 10);
        let mut c = parked(3, 20);

        insert_sleeping(&mut s, &mut a);
        insert_sleeping(&mut s, &mut b);
        insert_sleeping(&mut s, &mut c);
        assert_eq!(list_ids(&s), [2, 3, 1]);
    }

    #[test]
    fn equal_wake_times_keep_insertion_order() {
        let mut s = empty_state();
        let mut a = parked(1, 5);
        let mut b = parked(2, 5);
        let mut c = parked(3, 5);

        insert_sleeping(&mut s, &mut a);
        insert_sleeping(&mut s, &mut b);
        insert_sleeping(&mut s, &mut c);
        assert_eq!(list_ids(&s), [1, 2, 3]);
    }

    #[test]
    fn equal_wake_time_goes_after_existing_among_mixed() {
        let mut s = empty_state();
        let mut a = parked(1, 10);
        let mut b = parked(2, 1);
        let mut c = parked(3, 10);

        insert_sleeping(&mut s, &mut a);
        insert_sleeping(&mut s, &mut b);
        insert_sleeping(&mut s, &mut c);
        // b sorts first; c ties with a and must come after it.
        assert_eq!(list_ids(&s), [2, 1, 3]);
    }

    #[test]
    fn remove_head_middle_and_tail() {
        let mut s = empty_state();
        let mut a = parked(1, 10);
        let mut b = parked(2, 20);
        let mut c = parked(3, 30);

        insert_sleeping(&mut s, &mut a);
        insert_sleeping(&mut s, &mut b);
        insert_sleeping(&mut s, &mut c);

        remove_sleeping(&mut s, &mut b); // middle
        assert_eq!(list_ids(&s), [1, 3]);
        assert!(b.prev.is_null() && b.next.is_null());

        remove_sleeping(&mut s, &mut a); // head
        assert_eq!(list_ids(&s), [3]);
        assert_eq!(s.head, &mut c as *mut Task);

        remove_sleeping(&mut s, &mut c); // last
        assert!(s.head.is_null());
        assert!(list_ids(&s).is_empty());
    }

    #[test]
    fn reinsert_after_remove() {
        // The sleep/wake cycle: a task leaves the list and comes back with
        // a later wake time.
        let mut s = empty_state();
        let mut a = parked(1, 10);
        let mut b = parked(2, 20);

        insert_sleeping(&mut s, &mut a);
        insert_sleeping(&mut s, &mut b);

        remove_sleeping(&mut s, &mut a);
        a.wake_ms = 30;
        insert_sleeping(&mut s, &mut a);
        assert_eq!(list_ids(&s), [2, 1]);
    }
}
