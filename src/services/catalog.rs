//! Course catalog collaborator
//!
//! Fetching and scraping catalogs happens elsewhere; the core only asks for
//! the list of courses of a major. An empty list means "accept any number".

use async_trait::async_trait;
use std::collections::HashMap;

use crate::models::{Course, Major};
use crate::types::Result;

#[async_trait]
pub trait CourseCatalog: Send + Sync {
    /// Courses offered by a major, possibly empty
    async fn courses(&self, major: &Major) -> Result<Vec<Course>>;
}

/// Catalog without any entries; every course number is accepted
pub struct EmptyCatalog;

#[async_trait]
impl CourseCatalog for EmptyCatalog {
    async fn courses(&self, _major: &Major) -> Result<Vec<Course>> {
        Ok(Vec::new())
    }
}

/// Catalog with fixed course lists per major prefix
#[derive(Default)]
pub struct StaticCatalog {
    courses: HashMap<String, Vec<Course>>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_course(mut self, course: Course) -> Self {
        self.courses
            .entry(course.major.prefix.clone())
            .or_default()
            .push(course);
        self
    }
}

#[async_trait]
impl CourseCatalog for StaticCatalog {
    async fn courses(&self, major: &Major) -> Result<Vec<Course>> {
        Ok(self.courses.get(&major.prefix).cloned().unwrap_or_default())
    }
}
