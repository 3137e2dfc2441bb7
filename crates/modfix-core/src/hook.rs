//! Windows keystroke capture, injection and logical-state polling.
//!
//! Capture claims every hardware keystroke at the low-level hook and hands
//! it to the engine through a channel; whatever should reach applications is
//! re-injected, tagged so the hook ignores it on the way back around.

use crate::types::{EventSink, EventSource, LogicalKeyQuery, RawKeyEvent, ScKey};
use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{info, warn};
use windows::Win32::Foundation::{HINSTANCE, LPARAM, LRESULT, WPARAM};
use windows::Win32::System::Threading::GetCurrentThreadId;
use windows::Win32::UI::Input::KeyboardAndMouse::{
    GetAsyncKeyState, SendInput, INPUT, INPUT_0, INPUT_KEYBOARD, KEYBDINPUT, KEYEVENTF_EXTENDEDKEY,
    KEYEVENTF_KEYUP, KEYEVENTF_SCANCODE, VIRTUAL_KEY,
};
use windows::Win32::UI::WindowsAndMessaging::{
    CallNextHookEx, DispatchMessageW, GetMessageW, PeekMessageW, PostThreadMessageW,
    SetWindowsHookExW, TranslateMessage, UnhookWindowsHookEx, KBDLLHOOKSTRUCT, LLKHF_EXTENDED,
    MSG, PEEK_MESSAGE_REMOVE_TYPE, WH_KEYBOARD_LL, WM_KEYUP, WM_QUIT, WM_SYSKEYUP,
};

/// Magic number to identify our own injected events.
const INJECTED_EXTRA_INFO: usize = 0xFF0D51CC;

/// One capture per process; the hook callback feeds whichever sender is
/// parked here.
static HOOK_SENDER: Mutex<Option<Sender<RawKeyEvent>>> = Mutex::new(None);

/// Exclusive handle on the physical keystroke stream.
pub struct KeyboardCapture {
    events: Receiver<RawKeyEvent>,
    pump_thread_id: u32,
    pump: Option<JoinHandle<()>>,
}

impl KeyboardCapture {
    /// Installs the low-level hook on a dedicated message-pump thread.
    /// Fails if another capture is already installed in this process or the
    /// hook cannot be set.
    pub fn install() -> Result<Self> {
        let mut slot = HOOK_SENDER.lock().unwrap();
        if slot.is_some() {
            return Err(anyhow!("keyboard capture is already installed"));
        }
        let (sender, receiver) = unbounded();
        *slot = Some(sender);
        drop(slot);

        let (ready_tx, ready_rx) = bounded(1);
        let pump = match std::thread::Builder::new()
            .name("modfix-hook".into())
            .spawn(move || pump_loop(ready_tx))
        {
            Ok(pump) => pump,
            Err(err) => {
                HOOK_SENDER.lock().unwrap().take();
                return Err(err).context("failed to spawn hook thread");
            }
        };

        match ready_rx.recv() {
            Ok(Ok(pump_thread_id)) => {
                info!("keyboard hook installed");
                Ok(Self {
                    events: receiver,
                    pump_thread_id,
                    pump: Some(pump),
                })
            }
            Ok(Err(err)) => {
                let _ = pump.join();
                HOOK_SENDER.lock().unwrap().take();
                Err(err)
            }
            Err(_) => {
                let _ = pump.join();
                HOOK_SENDER.lock().unwrap().take();
                Err(anyhow!("hook thread exited before reporting readiness"))
            }
        }
    }
}

impl EventSource for KeyboardCapture {
    fn wait_for_event(&mut self, timeout: Duration) -> Option<RawKeyEvent> {
        match self.events.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                warn!("hook thread is gone, no more events");
                None
            }
        }
    }
}

impl Drop for KeyboardCapture {
    fn drop(&mut self) {
        unsafe {
            let _ = PostThreadMessageW(self.pump_thread_id, WM_QUIT, WPARAM(0), LPARAM(0));
        }
        if let Some(pump) = self.pump.take() {
            let _ = pump.join();
        }
        HOOK_SENDER.lock().unwrap().take();
        info!("keyboard hook uninstalled");
    }
}

fn pump_loop(ready: Sender<Result<u32>>) {
    unsafe {
        let mut msg = MSG::default();
        // Force message queue creation before the hook goes live.
        let _ = PeekMessageW(&mut msg, None, 0, 0, PEEK_MESSAGE_REMOVE_TYPE(0));

        let hook = match SetWindowsHookExW(WH_KEYBOARD_LL, Some(hook_proc), HINSTANCE::default(), 0)
        {
            Ok(hook) if !hook.is_invalid() => hook,
            Ok(_) => {
                let _ = ready.send(Err(anyhow!("keyboard hook handle is invalid")));
                return;
            }
            Err(err) => {
                let _ = ready.send(Err(anyhow!("failed to install keyboard hook: {err}")));
                return;
            }
        };

        let _ = ready.send(Ok(GetCurrentThreadId()));

        while GetMessageW(&mut msg, None, 0, 0).as_bool() {
            TranslateMessage(&msg);
            DispatchMessageW(&msg);
        }

        let _ = UnhookWindowsHookEx(hook);
    }
}

unsafe extern "system" fn hook_proc(code: i32, wparam: WPARAM, lparam: LPARAM) -> LRESULT {
    if code < 0 {
        return CallNextHookEx(None, code, wparam, lparam);
    }

    let kbd = &*(lparam.0 as *const KBDLLHOOKSTRUCT);

    // Pass our own injected events through untouched.
    if kbd.dwExtraInfo == INJECTED_EXTRA_INFO {
        return CallNextHookEx(None, code, wparam, lparam);
    }

    let msg = wparam.0 as u32;
    let up = msg == WM_KEYUP || msg == WM_SYSKEYUP;
    let ext = (kbd.flags.0 & LLKHF_EXTENDED.0) != 0;
    let event = RawKeyEvent {
        key: ScKey::new(kbd.scanCode as u16, ext),
        up,
    };

    if let Ok(slot) = HOOK_SENDER.lock() {
        if let Some(sender) = slot.as_ref() {
            if sender.send(event).is_ok() {
                // Claimed: the engine re-injects whatever should go through.
                return LRESULT(1);
            }
        }
    }

    CallNextHookEx(None, code, wparam, lparam)
}

/// Injects keystrokes via `SendInput`, marked so the hook skips them.
#[derive(Debug, Default)]
pub struct KeyInjector;

impl EventSink for KeyInjector {
    fn inject(&mut self, event: RawKeyEvent) -> Result<()> {
        let mut flags = KEYEVENTF_SCANCODE;
        if event.key.ext {
            flags |= KEYEVENTF_EXTENDEDKEY;
        }
        if event.up {
            flags |= KEYEVENTF_KEYUP;
        }

        let input = INPUT {
            r#type: INPUT_KEYBOARD,
            Anonymous: INPUT_0 {
                ki: KEYBDINPUT {
                    wVk: VIRTUAL_KEY(0),
                    wScan: event.key.sc,
                    dwFlags: flags,
                    time: 0,
                    dwExtraInfo: INJECTED_EXTRA_INFO,
                },
            },
        };

        let sent = unsafe { SendInput(&[input], std::mem::size_of::<INPUT>() as i32) };
        if sent == 0 {
            return Err(anyhow!("SendInput rejected the keystroke"));
        }
        Ok(())
    }
}

/// `GetAsyncKeyState` high-bit test, one call per monitored key per poll.
#[derive(Debug, Default)]
pub struct AsyncKeyQuery;

impl LogicalKeyQuery for AsyncKeyQuery {
    fn is_logically_pressed(&self, vk: u16) -> bool {
        unsafe { (GetAsyncKeyState(i32::from(vk)) as u16 & 0x8000) != 0 }
    }
}
