//! Emulator-facing side of the client.
//!
//! The host emulator's input callback runs on its own thread; everything
//! it touches lives here. Per netplay port there is one blocking frame
//! queue the network loop pushes merged button words into.

use parking_lot::{Condvar, Mutex};
use quadlink_netproto::constants::MAX_PLAYERS;
use quadlink_netproto::messages::session::Controller;

use crate::queue::BlockingQueue;

pub struct InputBridge {
    queues: [BlockingQueue<u32>; MAX_PLAYERS],
    controllers: Mutex<[Controller; MAX_PLAYERS]>,
    started: Mutex<bool>,
    started_cv: Condvar,
}

impl Default for InputBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl InputBridge {
    pub fn new() -> Self {
        Self {
            queues: Default::default(),
            controllers: Mutex::new([Controller::default(); MAX_PLAYERS]),
            started: Mutex::new(false),
            started_cv: Condvar::new(),
        }
    }

    /// Publish the merged netplay controller descriptors.
    pub fn set_netplay_controllers(&self, controllers: [Controller; MAX_PLAYERS]) {
        *self.controllers.lock() = controllers;
    }

    pub fn netplay_controllers(&self) -> [Controller; MAX_PLAYERS] {
        *self.controllers.lock()
    }

    /// Queue one merged button word for a netplay port.
    pub fn push_input(&self, port: usize, buttons: u32) {
        if let Some(queue) = self.queues.get(port) {
            // A latched interrupt only means the emulator is being
            // unblocked with zeroed words; nothing to do here.
            let _ = queue.push(buttons);
        }
    }

    /// Blocking read for the emulator's per-frame callback. Absent ports
    /// and interrupted queues yield a zeroed word so the emulator never
    /// hangs.
    pub fn get_input(&self, port: usize) -> u32 {
        let present = self
            .controllers
            .lock()
            .get(port)
            .is_some_and(|c| c.present);
        if !present {
            return 0;
        }
        match self.queues.get(port) {
            Some(queue) => queue.pop().unwrap_or(0),
            None => 0,
        }
    }

    pub fn set_started(&self) {
        let mut started = self.started.lock();
        if !*started {
            *started = true;
            self.started_cv.notify_all();
        }
    }

    /// Block until the game starts; returns false if the session was
    /// interrupted first.
    pub fn wait_for_start(&self) -> bool {
        let mut started = self.started.lock();
        while !*started {
            self.started_cv.wait(&mut started);
        }
        *started
    }

    pub fn is_started(&self) -> bool {
        *self.started.lock()
    }

    /// Unblock every consumer with the given reason.
    pub fn interrupt(&self, reason: &str) {
        for queue in &self.queues {
            queue.interrupt(reason);
        }
        // Release anyone parked in wait_for_start as well.
        let mut started = self.started.lock();
        *started = true;
        self.started_cv.notify_all();
    }

    /// Fresh state for a new connection.
    pub fn reset(&self) {
        for queue in &self.queues {
            queue.reset();
        }
        *self.controllers.lock() = [Controller::default(); MAX_PLAYERS];
        *self.started.lock() = false;
    }
}
