//! Event loop integration
//!
//! Drives the Wayland connection and the frame tick with calloop.

use std::io;
use std::os::fd::AsFd;
use std::time::Duration;

use anyhow::anyhow;
use calloop::generic::Generic;
use calloop::timer::{TimeoutAction, Timer};
use calloop::{EventLoop as CalLoop, Interest, LoopHandle, LoopSignal, Mode, PostAction, RegistrationToken};
use log::{debug, error, trace};
use wayland_client::Connection;

/// Event loop wrapper over shared state `D`
pub struct EventLoop<D: 'static> {
    /// Calloop event loop
    event_loop: CalLoop<'static, D>,
    /// Loop signal for waking/stopping
    signal: LoopSignal,
}

impl<D: 'static> EventLoop<D> {
    /// Create a new event loop
    pub fn new() -> anyhow::Result<Self> {
        let event_loop = CalLoop::try_new()?;
        let signal = event_loop.get_signal();

        Ok(Self { event_loop, signal })
    }

    /// Get a handle to register event sources
    pub fn handle(&self) -> LoopHandle<'static, D> {
        self.event_loop.handle()
    }

    /// Get the loop signal for waking
    pub fn signal(&self) -> LoopSignal {
        self.signal.clone()
    }

    /// Call `on_readable` whenever `fd` has data
    pub fn insert_fd<F>(
        &self,
        fd: F,
        mut on_readable: impl FnMut(&mut D) -> io::Result<()> + 'static,
    ) -> anyhow::Result<RegistrationToken>
    where
        F: AsFd + 'static,
    {
        let source = Generic::new(fd, Interest::READ, Mode::Level);
        self.event_loop
            .handle()
            .insert_source(source, move |_, _, data| {
                on_readable(data)?;
                Ok(PostAction::Continue)
            })
            .map_err(|e| anyhow!("Failed to register fd source: {}", e.error))
    }

    /// Watch the socket of a Wayland connection
    ///
    /// `on_readable` is expected to read and dispatch the connection's
    /// event queue.
    pub fn insert_connection(
        &self,
        connection: &Connection,
        on_readable: impl FnMut(&mut D) -> io::Result<()> + 'static,
    ) -> anyhow::Result<RegistrationToken> {
        let fd = connection.backend().poll_fd().try_clone_to_owned()?;
        debug!("Watching Wayland connection");
        self.insert_fd(fd, on_readable)
    }

    /// Call `tick` every `interval` until it returns false
    pub fn insert_tick(
        &self,
        interval: Duration,
        mut tick: impl FnMut(&mut D) -> bool + 'static,
    ) -> anyhow::Result<RegistrationToken> {
        self.event_loop
            .handle()
            .insert_source(Timer::from_duration(interval), move |_, _, data| {
                if tick(data) {
                    TimeoutAction::ToDuration(interval)
                } else {
                    trace!("Tick source finished");
                    TimeoutAction::Drop
                }
            })
            .map_err(|e| anyhow!("Failed to register timer: {}", e.error))
    }

    /// Remove a source added with one of the `insert_*` methods
    pub fn remove(&self, token: RegistrationToken) {
        self.event_loop.handle().remove(token);
    }

    /// Run one iteration of the event loop
    pub fn dispatch(&mut self, timeout: Option<Duration>, data: &mut D) -> anyhow::Result<()> {
        self.event_loop.dispatch(timeout, data)?;
        Ok(())
    }

    /// Run the event loop until [`stop`](Self::stop) is called
    pub fn run(&mut self, data: &mut D) -> anyhow::Result<()> {
        debug!("Starting event loop");

        if let Err(e) = self.event_loop.run(None, data, |_| {}) {
            error!("Event loop error: {}", e);
            return Err(e.into());
        }
        debug!("Event loop stopped");
        Ok(())
    }

    /// Stop the event loop
    pub fn stop(&self) {
        self.signal.stop();
    }

    /// Wake the event loop from another thread
    pub fn wake(&self) {
        self.signal.wakeup();
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;

    use super::*;

    #[test]
    fn test_event_loop_new() {
        let event_loop = EventLoop::<()>::new();
        assert!(event_loop.is_ok());
    }

    #[test]
    fn test_event_loop_dispatch() {
        let mut event_loop = EventLoop::<()>::new().unwrap();
        // Dispatch with zero timeout should return immediately
        let result = event_loop.dispatch(Some(Duration::ZERO), &mut ());
        assert!(result.is_ok());
    }

    #[test]
    fn test_fd_source_reads() {
        let mut event_loop = EventLoop::<Vec<u8>>::new().unwrap();
        let (mut writer, reader) = UnixStream::pair().unwrap();
        reader.set_nonblocking(true).unwrap();
        let mut source = reader.try_clone().unwrap();
        event_loop
            .insert_fd(reader, move |data: &mut Vec<u8>| {
                let mut buf = [0u8; 16];
                let n = source.read(&mut buf)?;
                data.extend_from_slice(&buf[..n]);
                Ok(())
            })
            .unwrap();

        writer.write_all(b"ping").unwrap();
        let mut received = Vec::new();
        event_loop
            .dispatch(Some(Duration::from_millis(500)), &mut received)
            .unwrap();
        assert_eq!(received, b"ping");
    }

    #[test]
    fn test_tick_runs_until_false() {
        let mut event_loop = EventLoop::<u32>::new().unwrap();
        event_loop
            .insert_tick(Duration::from_millis(1), |count: &mut u32| {
                *count += 1;
                *count < 3
            })
            .unwrap();

        let mut count = 0;
        for _ in 0..20 {
            event_loop
                .dispatch(Some(Duration::from_millis(10)), &mut count)
                .unwrap();
            if count == 3 {
                break;
            }
        }
        assert_eq!(count, 3);

        // The source is gone once the tick returned false
        event_loop
            .dispatch(Some(Duration::from_millis(5)), &mut count)
            .unwrap();
        assert_eq!(count, 3);
    }

    #[test]
    fn test_stop_ends_run() {
        let mut event_loop = EventLoop::<u32>::new().unwrap();
        let signal = event_loop.signal();
        event_loop
            .insert_tick(Duration::from_millis(1), move |count: &mut u32| {
                *count += 1;
                if *count == 2 {
                    signal.stop();
                }
                true
            })
            .unwrap();

        let mut count = 0;
        event_loop.run(&mut count).unwrap();
        assert_eq!(count, 2);
    }
}
