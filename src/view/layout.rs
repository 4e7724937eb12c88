use serde::{Deserialize, Serialize};

use crate::{config::Preferences, window::Size};

pub const SIDEBAR_WIDTH: u32 = 68;
pub const NAVIGATION_BAR_HEIGHT: u32 = 36;
pub const TITLE_BAR_HEIGHT: u32 = 22;
pub const FIND_IN_PAGE_HEIGHT: u32 = 50;

/// Position of a view inside the main window's content area.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bounds {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Chrome around the active view.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LayoutFlags {
    pub sidebar: bool,
    pub navigation_bar: bool,
    pub title_bar: bool,
    pub find_in_page: bool,
    pub full_screen: bool,
}
impl LayoutFlags {
    pub fn new(prefs: &Preferences, find_in_page: bool, full_screen: bool) -> Self {
        Self {
            sidebar: prefs.sidebar,
            navigation_bar: prefs.navigation_bar,
            title_bar: prefs.title_bar,
            find_in_page,
            full_screen,
        }
    }
}

pub fn compute_bounds(content: Size, flags: LayoutFlags) -> Bounds {
    let x = if flags.sidebar { SIDEBAR_WIDTH } else { 0 };
    let mut y = 0;
    // There is no title bar in full screen
    if flags.title_bar && !flags.full_screen {
        y += TITLE_BAR_HEIGHT;
    }
    if flags.navigation_bar {
        y += NAVIGATION_BAR_HEIGHT;
    }
    if flags.find_in_page {
        y += FIND_IN_PAGE_HEIGHT;
    }
    Bounds {
        x,
        y,
        width: content.width.saturating_sub(x),
        height: content.height.saturating_sub(y),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONTENT: Size = Size {
        width: 1000,
        height: 800,
    };

    #[test]
    fn chrome_offsets_the_view() {
        let flags = LayoutFlags {
            sidebar: true,
            navigation_bar: true,
            title_bar: true,
            ..Default::default()
        };
        assert_eq!(
            compute_bounds(CONTENT, flags),
            Bounds {
                x: 68,
                y: 58,
                width: 932,
                height: 742
            }
        );

        let searching = LayoutFlags {
            find_in_page: true,
            ..flags
        };
        assert_eq!(compute_bounds(CONTENT, searching).y, 108);
    }

    #[test]
    fn full_screen_drops_the_title_bar() {
        let flags = LayoutFlags {
            title_bar: true,
            full_screen: true,
            ..Default::default()
        };
        assert_eq!(
            compute_bounds(CONTENT, flags),
            Bounds {
                x: 0,
                y: 0,
                width: 1000,
                height: 800
            }
        );
    }

    #[test]
    fn tiny_windows_do_not_underflow() {
        let flags = LayoutFlags {
            sidebar: true,
            navigation_bar: true,
            ..Default::default()
        };
        let bounds = compute_bounds(
            Size {
                width: 10,
                height: 10,
            },
            flags,
        );
        assert_eq!((bounds.width, bounds.height), (0, 0));
    }
}
