/// Progress update callbacks
///
/// Multi-page flash writes report their progress through this trait so that
/// a front end can render a progress bar without the flasher depending on
/// any terminal machinery.
pub trait ProgressCallbacks {
    /// Initialize some progress report
    fn init(&mut self, addr: u32, total: usize);
    /// Update some progress report
    fn update(&mut self, current: usize);
    /// Finish some progress report
    fn finish(&mut self);
}
