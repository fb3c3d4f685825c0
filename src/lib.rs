
pub mod core {
    pub mod config;
    pub mod cpus;
    pub mod error;
    pub mod group;
    pub mod hardware;
    pub mod logging;
    pub mod module;
    pub mod registry;
    pub mod report;
    pub mod runner;
    pub mod signal;
    pub mod summary;

    #[cfg(test)]
    pub mod testing;
}


pub mod modules;


pub mod reporters;
