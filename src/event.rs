//! Event loop bridge: the cooperative poll loop and the objects that
//! publish asynchronous events into the signal protocol.
//!
//! One single-threaded loop drives everything. Sources are registered in
//! id-keyed tables and dispatched deterministically in id order; the loop
//! only holds weak references to the published objects, while each published
//! object holds a strong reference to the root context and couples its
//! lifetime to the root's teardown.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bitflags::bitflags;

use crate::error::{Error, Result};
use crate::object::{Object, WeakObject};
use crate::root::Root;
use crate::signal::{listen_to_destroyed, Listener};
use crate::types::{Type, Value};

bitflags! {
    /// Direction mask for fd-readiness sources and the `io` signal payload.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Interest: u32 {
        const READ = 1;
        const WRITE = 2;
    }
}

/// Wall-clock time in Unix seconds; the `now` payload of timer signals.
fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// First phase-aligned tick strictly after `now`.
fn periodic_next(interval: f64, offset: f64, now: f64) -> f64 {
    let k = ((now - offset) / interval).floor() + 1.0;
    offset + k * interval
}

// =============================================================================
// Event loop
// =============================================================================

struct FdSource {
    fd: RawFd,
    interest: Interest,
    enabled: bool,
    target: WeakObject,
}

enum TimerKind {
    /// Single-shot: disarmed after firing, re-armed by `again`.
    Oneshot { deadline: Option<Instant> },
    /// Phase-aligned repeating tick; stays armed across firings.
    Periodic { interval: f64, offset: f64, next: f64 },
}

struct TimerSource {
    kind: TimerKind,
    target: WeakObject,
}

/// The cooperative event loop. All registration and dispatch happens on the
/// loop thread.
pub struct EventLoop {
    fds: RefCell<BTreeMap<u64, FdSource>>,
    timers: RefCell<BTreeMap<u64, TimerSource>>,
    prepare_hooks: RefCell<Vec<WeakObject>>,
    next_id: Cell<u64>,
    quit: Cell<bool>,
}

impl Default for EventLoop {
    fn default() -> Self {
        EventLoop::new()
    }
}

impl EventLoop {
    pub fn new() -> EventLoop {
        EventLoop {
            fds: RefCell::new(BTreeMap::new()),
            timers: RefCell::new(BTreeMap::new()),
            prepare_hooks: RefCell::new(Vec::new()),
            next_id: Cell::new(1),
            quit: Cell::new(false),
        }
    }

    fn next_id(&self) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        id
    }

    /// Subscribes an object to the per-iteration `prepare` emission.
    pub(crate) fn add_prepare_hook(&self, target: WeakObject) {
        self.prepare_hooks.borrow_mut().push(target);
    }

    pub(crate) fn register_fd(&self, fd: RawFd, interest: Interest, target: WeakObject) -> u64 {
        let id = self.next_id();
        self.fds.borrow_mut().insert(
            id,
            FdSource {
                fd,
                interest,
                enabled: true,
                target,
            },
        );
        id
    }

    pub(crate) fn enable_fd(&self, id: u64, enabled: bool) {
        if let Some(src) = self.fds.borrow_mut().get_mut(&id) {
            src.enabled = enabled;
        }
    }

    pub(crate) fn fd_enabled(&self, id: u64) -> bool {
        self.fds
            .borrow()
            .get(&id)
            .map(|src| src.enabled)
            .unwrap_or(false)
    }

    pub(crate) fn remove_fd(&self, id: u64) {
        self.fds.borrow_mut().remove(&id);
    }

    pub(crate) fn add_oneshot(&self, target: WeakObject) -> u64 {
        let id = self.next_id();
        self.timers.borrow_mut().insert(
            id,
            TimerSource {
                kind: TimerKind::Oneshot { deadline: None },
                target,
            },
        );
        id
    }

    pub(crate) fn arm_oneshot(&self, id: u64, timeout: f64) {
        let timeout = if timeout.is_finite() && timeout > 0.0 {
            timeout
        } else {
            0.0
        };
        if let Some(timer) = self.timers.borrow_mut().get_mut(&id) {
            timer.kind = TimerKind::Oneshot {
                deadline: Some(Instant::now() + Duration::from_secs_f64(timeout)),
            };
        }
    }

    pub(crate) fn add_periodic(&self, interval: f64, offset: f64, target: WeakObject) -> u64 {
        let id = self.next_id();
        self.timers.borrow_mut().insert(
            id,
            TimerSource {
                kind: TimerKind::Periodic {
                    interval,
                    offset,
                    next: periodic_next(interval, offset, unix_now()),
                },
                target,
            },
        );
        id
    }

    pub(crate) fn set_periodic(&self, id: u64, interval: f64, offset: f64) {
        if let Some(timer) = self.timers.borrow_mut().get_mut(&id) {
            timer.kind = TimerKind::Periodic {
                interval,
                offset,
                next: periodic_next(interval, offset, unix_now()),
            };
        }
    }

    pub(crate) fn remove_timer(&self, id: u64) {
        self.timers.borrow_mut().remove(&id);
    }

    /// Asks the loop to return after the current iteration. Safe to call
    /// from within a handler.
    pub fn request_quit(&self) {
        self.quit.set(true);
    }

    /// Runs until quit is requested.
    pub fn run(&self) {
        self.quit.set(false);
        while !self.quit.get() {
            self.run_once(None);
        }
    }

    /// Runs for at most `duration`, or until quit is requested.
    pub fn run_for(&self, duration: Duration) {
        self.quit.set(false);
        let deadline = Instant::now() + duration;
        while !self.quit.get() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            self.run_once(Some(deadline - now));
        }
    }

    /// One loop iteration: prepare emission, poll with the nearest deadline,
    /// fd dispatch, timer dispatch.
    fn run_once(&self, max_wait: Option<Duration>) {
        let hooks: Vec<Object> = {
            let mut hooks = self.prepare_hooks.borrow_mut();
            hooks.retain(|w| w.upgrade().is_some());
            hooks.iter().filter_map(|w| w.upgrade()).collect()
        };
        for hook in hooks {
            if let Err(err) = hook.emit("prepare", vec![]) {
                log::warn!("prepare emission failed: {}", err);
            }
        }
        if self.quit.get() {
            return;
        }

        let now_inst = Instant::now();
        let now_unix = unix_now();
        let mut wait = max_wait;
        {
            let timers = self.timers.borrow();
            for timer in timers.values() {
                let remaining = match &timer.kind {
                    TimerKind::Oneshot { deadline: Some(d) } => {
                        d.saturating_duration_since(now_inst)
                    }
                    TimerKind::Oneshot { deadline: None } => continue,
                    TimerKind::Periodic { next, .. } => {
                        Duration::from_secs_f64((next - now_unix).max(0.0))
                    }
                };
                wait = Some(wait.map_or(remaining, |w| w.min(remaining)));
            }
        }
        let timeout_ms: libc::c_int = match wait {
            None => -1,
            // Round up so a timer is actually due when the poll wakes.
            Some(d) => ((d.as_nanos() + 999_999) / 1_000_000).min(i32::MAX as u128) as libc::c_int,
        };

        let mut ids: Vec<u64> = Vec::new();
        let mut pollfds: Vec<libc::pollfd> = Vec::new();
        {
            let fds = self.fds.borrow();
            for (id, src) in fds.iter() {
                if !src.enabled {
                    continue;
                }
                let mut events: libc::c_short = 0;
                if src.interest.contains(Interest::READ) {
                    events |= libc::POLLIN;
                }
                if src.interest.contains(Interest::WRITE) {
                    events |= libc::POLLOUT;
                }
                ids.push(*id);
                pollfds.push(libc::pollfd {
                    fd: src.fd,
                    events,
                    revents: 0,
                });
            }
        }

        let rc = unsafe {
            libc::poll(
                pollfds.as_mut_ptr(),
                pollfds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                log::error!("poll failed: {}", err);
            }
            return;
        }

        if rc > 0 {
            let mut ready: Vec<(Object, Interest)> = Vec::new();
            let mut gone: Vec<u64> = Vec::new();
            {
                let fds = self.fds.borrow();
                for (id, pfd) in ids.iter().zip(&pollfds) {
                    if pfd.revents == 0 {
                        continue;
                    }
                    let src = match fds.get(id) {
                        Some(src) => src,
                        None => continue,
                    };
                    let mut direction = Interest::empty();
                    if pfd.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0
                        && src.interest.contains(Interest::READ)
                    {
                        direction |= Interest::READ;
                    }
                    if pfd.revents & (libc::POLLOUT | libc::POLLERR) != 0
                        && src.interest.contains(Interest::WRITE)
                    {
                        direction |= Interest::WRITE;
                    }
                    if direction.is_empty() {
                        continue;
                    }
                    match src.target.upgrade() {
                        Some(obj) => ready.push((obj, direction)),
                        None => gone.push(*id),
                    }
                }
            }
            if !gone.is_empty() {
                let mut fds = self.fds.borrow_mut();
                for id in gone {
                    fds.remove(&id);
                }
            }
            for (obj, direction) in ready {
                if obj.is_destroyed() {
                    continue;
                }
                if direction.contains(Interest::READ) {
                    let _ = obj.emit("read", vec![]);
                }
                if direction.contains(Interest::WRITE) {
                    let _ = obj.emit("write", vec![]);
                }
                let _ = obj.emit("io", vec![Value::NUInt(direction.bits())]);
            }
        }

        let fire_inst = Instant::now();
        let fire_unix = unix_now();
        let mut fired: Vec<(Object, &'static str)> = Vec::new();
        {
            let mut timers = self.timers.borrow_mut();
            let mut gone: Vec<u64> = Vec::new();
            for (id, timer) in timers.iter_mut() {
                let due = match &mut timer.kind {
                    TimerKind::Oneshot { deadline } => match deadline {
                        Some(d) if *d <= fire_inst => {
                            // Stopped on fire; `again` re-arms.
                            *deadline = None;
                            true
                        }
                        _ => false,
                    },
                    TimerKind::Periodic {
                        interval,
                        offset,
                        next,
                    } => {
                        if *next <= fire_unix + 1e-6 {
                            *next = periodic_next(*interval, *offset, fire_unix);
                            true
                        } else {
                            false
                        }
                    }
                };
                if due {
                    match timer.target.upgrade() {
                        Some(obj) => {
                            let signal = match timer.kind {
                                TimerKind::Oneshot { .. } => "elapsed",
                                TimerKind::Periodic { .. } => "triggered",
                            };
                            fired.push((obj, signal));
                        }
                        None => gone.push(*id),
                    }
                }
            }
            for id in gone {
                timers.remove(&id);
            }
        }
        for (obj, signal) in fired {
            if obj.is_destroyed() {
                continue;
            }
            let _ = obj.emit(signal, vec![Value::Float(fire_unix)]);
        }
    }
}

// =============================================================================
// fd-readiness objects
// =============================================================================

struct IoevState {
    loop_: Rc<EventLoop>,
    id: Cell<Option<u64>>,
    fd: RawFd,
    // Keeps the root context alive while the source exists.
    #[allow(dead_code)]
    root: Object,
    root_listener: RefCell<Option<Listener>>,
}

/// Publishes fd readiness as an object with `start`/`stop`/`toggle`/`close`
/// methods and `read`/`write`/`io` signals. Starts enabled; the fd is closed
/// exactly once, on destruction.
pub(crate) fn create_fdevent(root: &Root, fd: RawFd, interest: Interest) -> Result<Object> {
    let obj = Object::new();
    obj.set_type_name("deai.builtin.event:ioev");
    obj.register_signal("read", vec![])?;
    obj.register_signal("write", vec![])?;
    obj.register_signal("io", vec![Type::NUInt])?;

    let loop_ = root.event_loop().clone();
    let id = loop_.register_fd(fd, interest, obj.downgrade());
    let state = Rc::new(IoevState {
        loop_,
        id: Cell::new(Some(id)),
        fd,
        root: root.object().clone(),
        root_listener: RefCell::new(None),
    });

    let st = state.clone();
    obj.add_method("start", move |_this: Object| -> Result<()> {
        if let Some(id) = st.id.get() {
            st.loop_.enable_fd(id, true);
        }
        Ok(())
    })?;
    let st = state.clone();
    obj.add_method("stop", move |_this: Object| -> Result<()> {
        if let Some(id) = st.id.get() {
            st.loop_.enable_fd(id, false);
        }
        Ok(())
    })?;
    let st = state.clone();
    obj.add_method("toggle", move |_this: Object| -> Result<()> {
        if let Some(id) = st.id.get() {
            let enabled = st.loop_.fd_enabled(id);
            st.loop_.enable_fd(id, !enabled);
        }
        Ok(())
    })?;
    obj.add_method("close", |this: Object| -> Result<()> {
        this.destroy();
        Ok(())
    })?;

    let st = state.clone();
    obj.set_destructor(move || {
        if let Some(listener) = st.root_listener.borrow_mut().take() {
            let _ = listener.stop();
        }
        if let Some(id) = st.id.take() {
            st.loop_.remove_fd(id);
            unsafe { libc::close(st.fd) };
        }
    });

    *state.root_listener.borrow_mut() = Some(listen_to_destroyed(root.object(), &obj)?);
    Ok(obj)
}

// =============================================================================
// Timer objects
// =============================================================================

struct TimerState {
    loop_: Rc<EventLoop>,
    id: Cell<Option<u64>>,
    timeout: Cell<f64>,
    #[allow(dead_code)]
    root: Object,
    root_listener: RefCell<Option<Listener>>,
}

/// Publishes a single-shot timer: signal `elapsed(now)`, method `again`, and
/// a `timeout` property whose writes re-arm the timer.
pub(crate) fn create_timer(root: &Root, timeout: f64) -> Result<Object> {
    let obj = Object::new();
    obj.set_type_name("deai.builtin.event:timer");
    obj.register_signal("elapsed", vec![Type::Float])?;

    let loop_ = root.event_loop().clone();
    let id = loop_.add_oneshot(obj.downgrade());
    loop_.arm_oneshot(id, timeout);
    let state = Rc::new(TimerState {
        loop_,
        id: Cell::new(Some(id)),
        timeout: Cell::new(timeout),
        root: root.object().clone(),
        root_listener: RefCell::new(None),
    });

    let st = state.clone();
    obj.add_method("again", move |_this: Object| -> Result<()> {
        if let Some(id) = st.id.get() {
            st.loop_.arm_oneshot(id, st.timeout.get());
        }
        Ok(())
    })?;
    let st = state.clone();
    let get = state.clone();
    obj.add_property(
        "timeout",
        move |_this: Object| -> Result<f64> { Ok(get.timeout.get()) },
        move |_this: Object, timeout: f64| -> Result<()> {
            st.timeout.set(timeout);
            if let Some(id) = st.id.get() {
                st.loop_.arm_oneshot(id, timeout);
            }
            Ok(())
        },
    )?;

    let st = state.clone();
    obj.set_destructor(move || {
        if let Some(listener) = st.root_listener.borrow_mut().take() {
            let _ = listener.stop();
        }
        if let Some(id) = st.id.take() {
            st.loop_.remove_timer(id);
        }
    });

    *state.root_listener.borrow_mut() = Some(listen_to_destroyed(root.object(), &obj)?);
    Ok(obj)
}

struct PeriodicState {
    loop_: Rc<EventLoop>,
    id: Cell<Option<u64>>,
    #[allow(dead_code)]
    root: Object,
    root_listener: RefCell<Option<Listener>>,
}

fn check_interval(interval: f64) -> Result<()> {
    if !interval.is_finite() || interval <= 0.0 {
        return Err(Error::InvalidArgument(
            "periodic interval must be positive".to_string(),
        ));
    }
    Ok(())
}

/// Publishes a phase-aligned repeating tick: signal `triggered(now)` and
/// method `set(interval, offset)`; stays armed across firings.
pub(crate) fn create_periodic(root: &Root, interval: f64, offset: f64) -> Result<Object> {
    check_interval(interval)?;
    if !offset.is_finite() {
        return Err(Error::InvalidArgument(
            "periodic offset must be finite".to_string(),
        ));
    }

    let obj = Object::new();
    obj.set_type_name("deai.builtin.event:periodic");
    obj.register_signal("triggered", vec![Type::Float])?;

    let loop_ = root.event_loop().clone();
    let id = loop_.add_periodic(interval, offset, obj.downgrade());
    let state = Rc::new(PeriodicState {
        loop_,
        id: Cell::new(Some(id)),
        root: root.object().clone(),
        root_listener: RefCell::new(None),
    });

    let st = state.clone();
    obj.add_method(
        "set",
        move |_this: Object, interval: f64, offset: f64| -> Result<()> {
            check_interval(interval)?;
            if let Some(id) = st.id.get() {
                st.loop_.set_periodic(id, interval, offset);
            }
            Ok(())
        },
    )?;

    let st = state.clone();
    obj.set_destructor(move || {
        if let Some(listener) = st.root_listener.borrow_mut().take() {
            let _ = listener.stop();
        }
        if let Some(id) = st.id.take() {
            st.loop_.remove_timer(id);
        }
    });

    *state.root_listener.borrow_mut() = Some(listen_to_destroyed(root.object(), &obj)?);
    Ok(obj)
}

// =============================================================================
// Event module
// =============================================================================

/// Registers the "event" module on the root: constructors `fdevent`,
/// `timer` and `periodic`, plus the per-iteration `prepare` signal.
pub(crate) fn init_event_module(root: &Root) -> Result<()> {
    let em = Object::new();
    em.set_type_name("deai.builtin:EventModule");
    em.register_signal("prepare", vec![])?;
    root.event_loop().add_prepare_hook(em.downgrade());

    let weak = root.downgrade();
    em.add_method(
        "fdevent",
        move |_this: Object, fd: i32, interest: u32| -> Result<Object> {
            let root = weak.upgrade().ok_or(Error::Dangling)?;
            create_fdevent(&root, fd, Interest::from_bits_truncate(interest))
        },
    )?;
    let weak = root.downgrade();
    em.add_method("timer", move |_this: Object, timeout: f64| -> Result<Object> {
        let root = weak.upgrade().ok_or(Error::Dangling)?;
        create_timer(&root, timeout)
    })?;
    let weak = root.downgrade();
    em.add_method(
        "periodic",
        move |_this: Object, interval: f64, offset: f64| -> Result<Object> {
            let root = weak.upgrade().ok_or(Error::Dangling)?;
            create_periodic(&root, interval, offset)
        },
    )?;

    root.register_module("event", em)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn periodic_next_is_phase_aligned() {
        let next = periodic_next(0.5, 0.0, 10.2);
        assert!((next - 10.5).abs() < 1e-9);
        let next = periodic_next(0.5, 0.25, 10.3);
        assert!((next - 10.75).abs() < 1e-9);
        // Strictly after `now`, even on an exact boundary.
        let next = periodic_next(0.5, 0.0, 10.5);
        assert!(next > 10.5);
    }

    #[test]
    fn interest_bits_round_trip() {
        let both = Interest::READ | Interest::WRITE;
        assert_eq!(Interest::from_bits_truncate(both.bits()), both);
        assert_eq!(both.bits(), 3);
    }

    #[test]
    fn loop_fires_oneshot_and_disarms() {
        let lp = EventLoop::new();
        let obj = Object::new();
        obj.register_signal("elapsed", vec![Type::Float]).unwrap();
        let id = lp.add_oneshot(obj.downgrade());
        lp.arm_oneshot(id, 0.01);

        let fired = Rc::new(Cell::new(0));
        let f = fired.clone();
        let handler = crate::callable::new_closure(
            move |_src: Object, _now: f64| -> Result<()> {
                f.set(f.get() + 1);
                Ok(())
            },
            vec![],
        )
        .unwrap();
        let _l = obj.listen("elapsed", handler, false).unwrap();

        lp.run_for(Duration::from_millis(50));
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn quit_from_prepare_stops_the_loop() {
        let lp = Rc::new(EventLoop::new());
        let em = Object::new();
        em.register_signal("prepare", vec![]).unwrap();
        lp.add_prepare_hook(em.downgrade());

        let lp2 = lp.clone();
        let handler = crate::callable::new_closure(
            move |_src: Object| -> Result<()> {
                lp2.request_quit();
                Ok(())
            },
            vec![],
        )
        .unwrap();
        let _l = em.listen("prepare", handler, false).unwrap();

        let start = Instant::now();
        lp.run();
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
