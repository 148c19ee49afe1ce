//! The braille window and its change-detection shadow.
//!
//! The text area holds `columns * rows` cells; an optional status area is
//! kept separately and rendered by the driver wherever its hardware puts
//! status cells. The shadow copy of the last transmitted cells lets the
//! session send only the runs that actually changed.

use std::ops::Range;

#[derive(Debug, Clone)]
pub struct BrailleBuffer {
    columns: usize,
    rows: usize,
    status_cells: usize,
    text: Vec<u8>,
    status: Vec<u8>,
    shadow: Vec<u8>,
    shadow_status: Vec<u8>,
    /// Forces the next diff to report everything, e.g. after reconnect.
    rewrite_required: bool,
    cursor: Option<usize>,
}

impl BrailleBuffer {
    pub fn new(columns: usize, rows: usize, status_cells: usize) -> Self {
        let cells = columns * rows;
        Self {
            columns,
            rows,
            status_cells,
            text: vec![0; cells],
            status: vec![0; status_cells],
            shadow: vec![0; cells],
            shadow_status: vec![0; status_cells],
            rewrite_required: true,
            cursor: None,
        }
    }

    pub fn columns(&self) -> usize {
        self.columns
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cell_count(&self) -> usize {
        self.text.len()
    }

    pub fn status_cell_count(&self) -> usize {
        self.status_cells
    }

    pub fn cells(&self) -> &[u8] {
        &self.text
    }

    pub fn status_cells(&self) -> &[u8] {
        &self.status
    }

    pub fn cursor(&self) -> Option<usize> {
        self.cursor
    }

    pub fn set_cursor(&mut self, cursor: Option<usize>) {
        self.cursor = cursor.filter(|c| *c < self.text.len());
    }

    /// Replace the whole text area. Shorter input blanks the tail.
    pub fn set_cells(&mut self, cells: &[u8]) {
        let n = cells.len().min(self.text.len());
        self.text[..n].copy_from_slice(&cells[..n]);
        self.text[n..].fill(0);
    }

    /// Overwrite a region of the text area.
    pub fn set_region(&mut self, begin: usize, cells: &[u8]) {
        if begin >= self.text.len() {
            return;
        }
        let n = cells.len().min(self.text.len() - begin);
        self.text[begin..begin + n].copy_from_slice(&cells[..n]);
    }

    pub fn set_status_cells(&mut self, cells: &[u8]) {
        let n = cells.len().min(self.status.len());
        self.status[..n].copy_from_slice(&cells[..n]);
        self.status[n..].fill(0);
    }

    /// Resize the window, invalidating the shadow.
    pub fn resize(&mut self, columns: usize, rows: usize) {
        self.columns = columns;
        self.rows = rows;
        let cells = columns * rows;
        self.text = vec![0; cells];
        self.shadow = vec![0; cells];
        self.rewrite_required = true;
        self.cursor = None;
    }

    /// Mark everything changed regardless of the shadow contents.
    pub fn force_rewrite(&mut self) {
        self.rewrite_required = true;
    }

    /// Changed cell runs since the last `commit`, merging runs separated by
    /// fewer than `max_gap` unchanged cells (a handful of unchanged bytes is
    /// cheaper to resend than a second packet header).
    pub fn changed_runs(&self, max_gap: usize) -> Vec<Range<usize>> {
        if self.rewrite_required {
            return if self.text.is_empty() {
                Vec::new()
            } else {
                vec![0..self.text.len()]
            };
        }
        let mut runs: Vec<Range<usize>> = Vec::new();
        let mut i = 0;
        while i < self.text.len() {
            if self.text[i] == self.shadow[i] {
                i += 1;
                continue;
            }
            let start = i;
            while i < self.text.len() && self.text[i] != self.shadow[i] {
                i += 1;
            }
            match runs.last_mut() {
                Some(last) if start - last.end <= max_gap => last.end = i,
                _ => runs.push(start..i),
            }
        }
        runs
    }

    /// Whether the status area differs from its shadow.
    pub fn status_changed(&self) -> bool {
        self.rewrite_required || self.status != self.shadow_status
    }

    /// Record the current contents as transmitted.
    pub fn commit(&mut self) {
        self.shadow.copy_from_slice(&self.text);
        self.shadow_status.copy_from_slice(&self.status);
        self.rewrite_required = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn fresh_buffer_reports_everything_changed() {
        let buf = BrailleBuffer::new(40, 1, 0);
        assert_eq!(buf.changed_runs(0), vec![0..40]);
    }

    #[test]
    fn committed_buffer_reports_no_changes() {
        let mut buf = BrailleBuffer::new(40, 1, 0);
        buf.commit();
        assert_eq!(buf.changed_runs(0), Vec::<Range<usize>>::new());
    }

    #[test]
    fn only_modified_runs_are_reported() {
        let mut buf = BrailleBuffer::new(40, 1, 0);
        buf.commit();
        let mut cells = vec![0u8; 40];
        cells[3] = 0x07;
        cells[4] = 0x38;
        cells[20] = 0xFF;
        buf.set_cells(&cells);
        assert_eq!(buf.changed_runs(0), vec![3..5, 20..21]);
    }

    #[test]
    fn nearby_runs_merge_within_the_gap() {
        let mut buf = BrailleBuffer::new(40, 1, 0);
        buf.commit();
        let mut cells = vec![0u8; 40];
        cells[3] = 1;
        cells[6] = 1;
        buf.set_cells(&cells);
        assert_eq!(buf.changed_runs(2), vec![3..7]);
        assert_eq!(buf.changed_runs(1), vec![3..4, 6..7]);
    }

    #[test]
    fn resize_forces_a_full_rewrite() {
        let mut buf = BrailleBuffer::new(40, 1, 0);
        buf.commit();
        buf.resize(80, 1);
        assert_eq!(buf.changed_runs(0), vec![0..80]);
        assert_eq!(buf.cursor(), None);
    }

    #[test]
    fn cursor_outside_the_window_is_dropped() {
        let mut buf = BrailleBuffer::new(10, 1, 0);
        buf.set_cursor(Some(9));
        assert_eq!(buf.cursor(), Some(9));
        buf.set_cursor(Some(10));
        assert_eq!(buf.cursor(), None);
    }

    #[test]
    fn status_area_is_tracked_separately() {
        let mut buf = BrailleBuffer::new(10, 1, 4);
        buf.commit();
        assert!(!buf.status_changed());
        buf.set_status_cells(&[1, 2, 3, 4]);
        assert!(buf.status_changed());
        assert_eq!(buf.changed_runs(0), Vec::<Range<usize>>::new());
        buf.commit();
        assert!(!buf.status_changed());
    }
}
