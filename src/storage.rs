//! In-memory GPX document and its writer.

use std::collections::BTreeSet;
use std::ffi::OsString;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::config::GpxConfig;
use crate::error::GpxError;
use crate::model::{HeartRateSample, PointKind, Waypoint};
use crate::time::format_time;
use crate::xml_tree::{Element, Node};

pub const GPX_NAMESPACE: &str = "http://www.topografix.com/GPX/1/1";
pub const XSI_NAMESPACE: &str = "http://www.w3.org/2001/XMLSchema-instance";
pub const GPX_SCHEMA_LOCATION: &str =
    "http://www.topografix.com/GPX/1/1 http://www.topografix.com/GPX/1/1/gpx.xsd";
/// Private namespace of the per-segment heart-rate list.
pub const HEART_RATE_NAMESPACE: &str = "urn:gpx-track-recorder:heart-rate:1";
const HEART_RATE_PREFIX: &str = "hr";

// Schema order of <trk> and <rte> children.
const TRACK_CHILD_ORDER: &[&str] = &[
    "name", "cmt", "desc", "src", "link", "number", "type", "extensions", "trkseg",
];
const ROUTE_CHILD_ORDER: &[&str] = &[
    "name", "cmt", "desc", "src", "link", "number", "type", "extensions", "rtept",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentKind {
    Track,
    Route,
}

impl ParentKind {
    fn element_name(self) -> &'static str {
        match self {
            ParentKind::Track => "trk",
            ParentKind::Route => "rte",
        }
    }

    fn child_order(self) -> &'static [&'static str] {
        match self {
            ParentKind::Track => TRACK_CHILD_ORDER,
            ParentKind::Route => ROUTE_CHILD_ORDER,
        }
    }
}

/// Sorted set of ids in use. Hands out the smallest free id starting at 1,
/// so a released id is reused before a new maximum is taken.
#[derive(Debug, Clone, Default)]
pub struct IdAllocator {
    ids: BTreeSet<u32>,
}

impl IdAllocator {
    pub fn allocate(&mut self) -> u32 {
        let mut candidate = 1;
        for &id in self.ids.range(1..) {
            if id != candidate {
                break;
            }
            candidate += 1;
        }
        self.ids.insert(candidate);
        candidate
    }

    /// Marks an externally assigned id as used. Returns false if it already was.
    pub fn reserve(&mut self, id: u32) -> bool {
        self.ids.insert(id)
    }

    pub fn release(&mut self, id: u32) -> bool {
        self.ids.remove(&id)
    }

    pub fn contains(&self, id: u32) -> bool {
        self.ids.contains(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.ids.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// A GPX document kept as an XML tree, mutated sample by sample and
/// serialized as a whole.
#[derive(Debug, Clone)]
pub struct GpxDocument {
    root: Element,
    path: Option<PathBuf>,
    config: GpxConfig,
    track_ids: IdAllocator,
    route_ids: IdAllocator,
}

impl GpxDocument {
    pub fn new(config: GpxConfig) -> Self {
        let root = Element::new("gpx")
            .with_attr("version", "1.1")
            .with_attr("creator", config.creator.as_str())
            .with_attr("xmlns", GPX_NAMESPACE)
            .with_attr("xmlns:xsi", XSI_NAMESPACE)
            .with_attr("xsi:schemaLocation", GPX_SCHEMA_LOCATION)
            .with_attr(format!("xmlns:{HEART_RATE_PREFIX}"), HEART_RATE_NAMESPACE);
        Self {
            root,
            path: None,
            config,
            track_ids: IdAllocator::default(),
            route_ids: IdAllocator::default(),
        }
    }

    /// Loads an existing file so new tracks can be appended to it.
    pub fn open(path: impl AsRef<Path>, config: GpxConfig) -> Result<Self, GpxError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| GpxError::file(path, e))?;
        let mut root = Element::read(BufReader::new(file))?;
        if root.local_name() != "gpx" {
            return Err(GpxError::FileFormat { found: root.name });
        }
        let hr_ns_attr = format!("xmlns:{HEART_RATE_PREFIX}");
        if root.attr(&hr_ns_attr).is_none() {
            root.set_attr(hr_ns_attr, HEART_RATE_NAMESPACE);
        }

        let mut document = Self {
            root,
            path: Some(path.to_path_buf()),
            config,
            track_ids: IdAllocator::default(),
            route_ids: IdAllocator::default(),
        };
        document.rebuild_ids();
        tracing::debug!(
            path = %path.display(),
            tracks = document.track_ids.len(),
            routes = document.route_ids.len(),
            "opened GPX document"
        );
        Ok(document)
    }

    fn rebuild_ids(&mut self) {
        for element in self.root.elements() {
            let allocator = match element.local_name() {
                "trk" => &mut self.track_ids,
                "rte" => &mut self.route_ids,
                _ => continue,
            };
            if let Some(id) = parent_number(element) {
                if !allocator.reserve(id) {
                    tracing::warn!(id, name = %element.name, "duplicate id in document");
                }
            }
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn set_path(&mut self, path: impl Into<PathBuf>) {
        self.path = Some(path.into());
    }

    pub fn config(&self) -> &GpxConfig {
        &self.config
    }

    pub fn track_ids(&self) -> &IdAllocator {
        &self.track_ids
    }

    pub fn route_ids(&self) -> &IdAllocator {
        &self.route_ids
    }

    pub fn root(&self) -> &Element {
        &self.root
    }

    /// Number of <trkseg> children of the track, if it exists.
    pub fn segment_count(&self, track_id: u32) -> Option<usize> {
        self.find_parent(ParentKind::Track, track_id)
            .map(|trk| trk.elements().filter(|e| e.local_name() == "trkseg").count())
    }

    /// Stores a point under the track or route its kind resolves to.
    ///
    /// `TrackStart` and `RouteStart` allocate a new parent and ignore
    /// `parent_id`; the other kinds need the id of an existing parent. Returns
    /// the id of the parent that received the point, or `None` (with a logged
    /// warning) when no parent could be resolved.
    pub fn add_waypoint(&mut self, point: &Waypoint, parent_id: Option<u32>) -> Option<u32> {
        match point.kind {
            PointKind::RouteStart | PointKind::Route => {
                let id = match (point.kind, parent_id) {
                    (PointKind::RouteStart, _) => self.create_parent(ParentKind::Route),
                    (_, Some(id)) => id,
                    (_, None) => {
                        tracing::warn!("no current route for point");
                        return None;
                    }
                };
                let element = self.point_element("rtept", point);
                let Some(rte) = self.find_parent_mut(ParentKind::Route, id) else {
                    tracing::warn!(id, "no route to add the point to");
                    return None;
                };
                rte.push(element);
                Some(id)
            }
            kind => {
                let element = self.point_element("trkpt", point);
                let (id, segment) = self.resolve_segment(kind, parent_id)?;
                segment.insert_before_any(element, &["extensions"]);
                Some(id)
            }
        }
    }

    /// Stores a heart-rate reading in the extension list of the segment its
    /// kind resolves to. Same resolution rules as [`Self::add_waypoint`].
    pub fn add_heart_rate(
        &mut self,
        kind: PointKind,
        track_id: Option<u32>,
        sample: &HeartRateSample,
    ) -> Option<u32> {
        if kind.is_route() {
            tracing::warn!(?kind, "heart rate cannot be stored in a route");
            return None;
        }
        let time = format_time(&sample.time, self.config.ignore_time_zone);
        let (id, segment) = self.resolve_segment(kind, track_id)?;

        // <extensions> is the last child allowed in <trkseg>.
        let extensions = match segment.position_of_any(&["extensions"]) {
            Some(_) => segment.child_mut("extensions"),
            None => {
                segment.push(Element::new("extensions"));
                segment.last_child_mut("extensions")
            }
        }?;
        let list_name = format!("{HEART_RATE_PREFIX}:hbtlist");
        if extensions.child("hbtlist").is_none() {
            extensions.push(Element::new(list_name));
        }
        let list = extensions.child_mut("hbtlist")?;
        list.push(
            Element::new(format!("{HEART_RATE_PREFIX}:hbt"))
                .with_attr("time", time)
                .with_attr("value", sample.bpm.to_string()),
        );
        Some(id)
    }

    /// Inserts or overwrites the name and comment of a track or route,
    /// keeping them ahead of the other children. Returns false if no parent
    /// has the id.
    pub fn set_details(
        &mut self,
        kind: ParentKind,
        id: u32,
        name: Option<&str>,
        comment: Option<&str>,
    ) -> bool {
        let Some(parent) = self.find_parent_mut(kind, id) else {
            tracing::warn!(?kind, id, "no parent for details");
            return false;
        };
        let order = kind.child_order();
        if let Some(name) = name {
            set_ordered_child(parent, "name", name, order);
        }
        if let Some(comment) = comment {
            set_ordered_child(parent, "cmt", comment, order);
        }
        true
    }

    /// Removes a track and frees its id for reuse.
    pub fn remove_track(&mut self, id: u32) -> bool {
        self.remove_parent(ParentKind::Track, id)
    }

    pub fn remove_route(&mut self, id: u32) -> bool {
        self.remove_parent(ParentKind::Route, id)
    }

    fn remove_parent(&mut self, kind: ParentKind, id: u32) -> bool {
        let name = kind.element_name();
        let Some(index) = self.root.children.iter().position(|child| match child {
            Node::Element(e) => {
                e.local_name() == name && parent_number(e) == Some(id)
            }
            Node::Text(_) => false,
        }) else {
            return false;
        };
        self.root.children.remove(index);
        match kind {
            ParentKind::Track => self.track_ids.release(id),
            ParentKind::Route => self.route_ids.release(id),
        };
        true
    }

    /// Serializes the document to its path. Writes a sibling temporary file
    /// first and renames it over the target. No retries.
    pub fn write(&self) -> Result<(), GpxError> {
        let Some(path) = self.path.as_deref() else {
            return Err(GpxError::Io(std::io::Error::other(
                "GPX document has no output path",
            )));
        };
        let mut tmp_name = OsString::from(path.as_os_str());
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        let file = File::create(&tmp_path).map_err(|e| GpxError::file(&tmp_path, e))?;
        let mut sink = BufWriter::new(file);
        self.root
            .write_document(&mut sink)
            .and_then(|()| sink.flush())
            .map_err(|e| GpxError::file(&tmp_path, e))?;
        drop(sink);
        std::fs::rename(&tmp_path, path).map_err(|e| GpxError::file(path, e))?;

        tracing::info!(path = %path.display(), tracks = self.track_ids.len(), "wrote GPX document");
        Ok(())
    }

    pub fn write_to<W: Write>(&self, sink: W) -> Result<(), GpxError> {
        self.root.write_document(sink)?;
        Ok(())
    }

    fn create_parent(&mut self, kind: ParentKind) -> u32 {
        let id = match kind {
            ParentKind::Track => self.track_ids.allocate(),
            ParentKind::Route => self.route_ids.allocate(),
        };
        let mut parent = Element::new(kind.element_name());
        parent.push(Element::with_text("number", id.to_string()));
        self.root.push(parent);
        tracing::debug!(?kind, id, "created parent");
        id
    }

    /// Finds (or opens) the segment a track sample of `kind` belongs in.
    fn resolve_segment(
        &mut self,
        kind: PointKind,
        track_id: Option<u32>,
    ) -> Option<(u32, &mut Element)> {
        let id = match (kind, track_id) {
            (PointKind::TrackStart, _) => self.create_parent(ParentKind::Track),
            (_, Some(id)) => id,
            (_, None) => {
                tracing::warn!(?kind, "no current track for point");
                return None;
            }
        };
        let Some(trk) = self.find_parent_mut(ParentKind::Track, id) else {
            tracing::warn!(id, "no track with this id");
            return None;
        };
        if kind.opens_segment() {
            trk.push(Element::new("trkseg"));
        }
        match trk.last_child_mut("trkseg") {
            Some(segment) => Some((id, segment)),
            None => {
                tracing::warn!(id, "track has no segment to append to");
                None
            }
        }
    }

    // Linear scan; the first parent whose <number> matches wins.
    fn find_parent(&self, kind: ParentKind, id: u32) -> Option<&Element> {
        let name = kind.element_name();
        self.root
            .elements()
            .find(|e| e.local_name() == name && parent_number(e) == Some(id))
    }

    fn find_parent_mut(&mut self, kind: ParentKind, id: u32) -> Option<&mut Element> {
        let name = kind.element_name();
        self.root
            .elements_mut()
            .find(|e| e.local_name() == name && parent_number(e) == Some(id))
    }

    fn point_element(&self, name: &str, point: &Waypoint) -> Element {
        let mut element = Element::new(name)
            .with_attr("lat", point.latitude.to_string())
            .with_attr("lon", point.longitude.to_string());
        if let Some(altitude) = point.altitude {
            element.push(Element::with_text("ele", altitude.to_string()));
        }
        if let Some(time) = &point.time {
            element.push(Element::with_text(
                "time",
                format_time(time, self.config.ignore_time_zone),
            ));
        }
        element
    }
}

impl Default for GpxDocument {
    fn default() -> Self {
        Self::new(GpxConfig::default())
    }
}

fn parent_number(parent: &Element) -> Option<u32> {
    parent.child("number")?.text().trim().parse().ok()
}

/// Overwrites `local` or inserts it before the first child that follows it
/// in `order`.
fn set_ordered_child(parent: &mut Element, local: &str, text: &str, order: &[&str]) {
    if let Some(existing) = parent.child_mut(local) {
        existing.set_text(text);
        return;
    }
    let followers = order
        .iter()
        .position(|name| *name == local)
        .map_or(&[][..], |i| &order[i + 1..]);
    parent.insert_before_any(Element::with_text(local, text), followers);
}
