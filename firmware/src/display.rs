//! Display front end that records page requests in the log.
//!
//! Panel rendering is not part of this firmware; the orchestrator's page
//! calls are logged so a serial console shows what the e-paper would draw.

use core::time::Duration;

use button_core::orchestrator::{Display, DisplayState};

/// Page most recently requested.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Page {
    Blank,
    Main,
    Info,
    Welcome,
    Message,
    Error,
}

pub struct LogDisplay {
    page: Page,
    powered: bool,
    updates: u32,
}

impl LogDisplay {
    pub const fn new() -> Self {
        Self {
            page: Page::Blank,
            powered: true,
            updates: 0,
        }
    }

    pub const fn page(&self) -> Page {
        self.page
    }

    pub const fn updates(&self) -> u32 {
        self.updates
    }

    fn show(&mut self, page: Page) {
        self.page = page;
        self.powered = true;
        self.updates = self.updates.saturating_add(1);
    }
}

impl Default for LogDisplay {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for LogDisplay {
    fn disp_main(&mut self) {
        self.show(Page::Main);
        emit_page("main", None);
    }

    fn disp_info(&mut self) {
        self.show(Page::Info);
        emit_page("info", None);
    }

    fn disp_welcome(&mut self) {
        self.show(Page::Welcome);
        emit_page("welcome", None);
    }

    fn disp_message(&mut self, text: &str, duration: Option<Duration>) {
        self.show(Page::Message);
        emit_text("message", text, duration);
    }

    fn disp_error(&mut self, text: &str, duration: Option<Duration>) {
        self.show(Page::Error);
        emit_text("error", text, duration);
    }

    fn end(&mut self) {
        if self.powered {
            self.powered = false;
            emit_page("off", None);
        }
    }

    fn state(&self) -> DisplayState {
        DisplayState::Idle
    }
}

fn millis(duration: Option<Duration>) -> u64 {
    duration.map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

#[cfg(target_os = "none")]
fn emit_page(page: &str, duration: Option<Duration>) {
    defmt::info!("display: {=str} hold={}ms", page, millis(duration));
}

#[cfg(not(target_os = "none"))]
fn emit_page(page: &str, duration: Option<Duration>) {
    println!("display: {page} hold={}ms", millis(duration));
}

#[cfg(target_os = "none")]
fn emit_text(page: &str, text: &str, duration: Option<Duration>) {
    defmt::info!(
        "display: {=str} {=str:?} hold={}ms",
        page,
        text,
        millis(duration)
    );
}

#[cfg(not(target_os = "none"))]
fn emit_text(page: &str, text: &str, duration: Option<Duration>) {
    println!("display: {page} {text:?} hold={}ms", millis(duration));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_last_page_and_powers_down_once() {
        let mut display = LogDisplay::new();
        display.disp_welcome();
        display.disp_message("Fully\ncharged!", Some(Duration::from_secs(3)));
        assert_eq!(display.page(), Page::Message);
        assert_eq!(display.updates(), 2);

        display.end();
        display.end();
        assert_eq!(display.state(), DisplayState::Idle);

        display.disp_main();
        assert_eq!(display.page(), Page::Main);
    }
}
